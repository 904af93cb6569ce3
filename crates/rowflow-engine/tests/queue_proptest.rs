use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rowflow_engine::{QueueRead, RowQueue};
use rowflow_types::{FieldMeta, Row, RowMeta, Value, ValueType};

fn meta() -> Arc<RowMeta> {
    Arc::new(RowMeta::new(vec![FieldMeta::new("v", ValueType::Integer)]))
}

fn drain(queue: &RowQueue) -> Vec<i64> {
    let mut got = Vec::new();
    loop {
        match queue.get(Duration::from_millis(500)) {
            QueueRead::Row(_, row) => got.push(row.get(0).and_then(Value::as_integer).unwrap()),
            QueueRead::EndOfStream => return got,
            QueueRead::TimedOut => {}
            other => panic!("unexpected read {other:?}"),
        }
    }
}

proptest! {
    #[test]
    fn queue_is_fifo_and_never_exceeds_capacity(
        values in prop::collection::vec(any::<i64>(), 0..200),
        capacity in 1_usize..16,
    ) {
        let queue = Arc::new(RowQueue::new("prop", capacity));
        let producer = {
            let queue = Arc::clone(&queue);
            let values = values.clone();
            std::thread::spawn(move || {
                let meta = meta();
                for v in values {
                    assert!(queue.len() <= queue.capacity());
                    assert!(queue.put(Arc::clone(&meta), Row::new(vec![Value::Integer(v)])));
                }
                queue.mark_done();
            })
        };
        let got = drain(&queue);
        producer.join().unwrap();
        prop_assert_eq!(got, values);
        prop_assert!(queue.is_empty());
    }

    #[test]
    fn rows_put_after_close_are_discarded(extra in 0_u64..50) {
        let queue = RowQueue::new("feedback", 4);
        queue.put(meta(), Row::new(vec![Value::Integer(1)]));
        queue.close();
        for i in 0..extra {
            let v = i64::try_from(i).unwrap();
            prop_assert!(queue.put(meta(), Row::new(vec![Value::Integer(v)])));
        }
        prop_assert_eq!(queue.discarded(), extra + 1);
        prop_assert!(queue.is_empty());
    }
}
