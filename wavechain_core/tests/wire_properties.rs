//! Property checks on the wire model

use proptest::prelude::*;
use wavechain_core::communication::{OverflowPolicy, RelayBuffer};
use wavechain_core::message::{Envelope, Payload, SensorVector, TimeEncoding};

fn vector_strategy() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(20.0f64..=127.0, 30)
}

proptest! {
    #[test]
    fn movement_envelope_survives_json(values in vector_strategy(), angle in 0.0f64..std::f64::consts::TAU) {
        let vector = SensorVector::new(values.clone()).unwrap();
        let time = TimeEncoding::new(angle.sin(), angle.cos()).unwrap();
        let text = Envelope::movement(vector, time).to_json().unwrap();

        let parsed = Envelope::from_json(&text).unwrap();
        match parsed.payload {
            Payload::MovementData(movement) => {
                prop_assert_eq!(movement.vector.values(), values.as_slice());
                prop_assert_eq!(movement.time.sin(), angle.sin());
                prop_assert_eq!(movement.time.cos(), angle.cos());
            }
            other => prop_assert!(false, "unexpected payload {:?}", other),
        }
    }

    #[test]
    fn out_of_range_values_are_rejected(index in 0usize..30, value in prop_oneof![-1e6f64..19.99, 127.01f64..1e6]) {
        let mut values = vec![50.0; 30];
        values[index] = value;
        prop_assert!(SensorVector::new(values).is_err());
    }

    #[test]
    fn relay_buffer_never_exceeds_capacity(pushes in 0usize..40, capacity in 1usize..10) {
        let mut buffer = RelayBuffer::new(capacity, OverflowPolicy::RejectNew);
        for _ in 0..pushes {
            buffer.push(Envelope::ack());
        }
        prop_assert_eq!(buffer.len(), pushes.min(capacity));
        prop_assert_eq!(buffer.dropped() as usize, pushes.saturating_sub(capacity));
    }
}
