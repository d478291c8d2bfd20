use taskmesh::event_bus::{EventBus, EventKind};

fn log_event(n: usize) -> EventKind {
    EventKind::LogEntry {
        level: "info".to_string(),
        message: format!("event-{}", n),
    }
}

fn message_of(kind: &EventKind) -> &str {
    match kind {
        EventKind::LogEntry { message, .. } => message.as_str(),
        _ => panic!("expected log_entry"),
    }
}

#[tokio::test]
async fn events_arrive_in_publish_order() {
    let bus = EventBus::new("task-1");
    let mut subscriber = bus.subscribe().unwrap();

    for n in 0..100 {
        bus.publish(log_event(n));
    }

    for n in 0..100 {
        let event = subscriber.next_event().await.unwrap();
        assert_eq!(event.task_id, "task-1");
        assert_eq!(message_of(&event.kind), format!("event-{}", n));
    }
}

#[tokio::test]
async fn subscribers_do_not_see_history() {
    let bus = EventBus::new("task-1");
    bus.publish(log_event(0));

    let mut subscriber = bus.subscribe().unwrap();
    bus.publish(log_event(1));

    let event = subscriber.next_event().await.unwrap();
    assert_eq!(message_of(&event.kind), "event-1");
}

#[tokio::test]
async fn fan_out_reaches_every_subscriber() {
    let bus = EventBus::new("task-1");
    let mut first = bus.subscribe().unwrap();
    let mut second = bus.subscribe().unwrap();

    bus.publish(log_event(7));

    assert_eq!(message_of(&first.next_event().await.unwrap().kind), "event-7");
    assert_eq!(message_of(&second.next_event().await.unwrap().kind), "event-7");
}

#[tokio::test]
async fn slow_subscriber_drops_only_its_own_oldest_events() {
    let bus = EventBus::with_capacity("task-1", 4);
    let mut slow = bus.subscribe().unwrap();
    let mut fast = bus.subscribe().unwrap();

    let mut fast_seen = Vec::new();
    for n in 0..10 {
        bus.publish(log_event(n));
        // The fast subscriber keeps up; the slow one never polls.
        if let Ok(Some(event)) = fast.try_next_event() {
            fast_seen.push(message_of(&event.kind).to_string());
        }
    }
    while let Ok(Some(event)) = fast.try_next_event() {
        fast_seen.push(message_of(&event.kind).to_string());
    }

    assert_eq!(fast_seen.len(), 10);
    assert_eq!(fast.dropped_events(), 0);

    // The slow subscriber lost the oldest events, kept the newest, and its
    // drop counter accounts for the difference.
    let mut slow_seen = Vec::new();
    while let Ok(Some(event)) = slow.try_next_event() {
        slow_seen.push(message_of(&event.kind).to_string());
    }
    assert!(slow.dropped_events() > 0);
    assert_eq!(slow_seen.len() as u64 + slow.dropped_events(), 10);
    assert_eq!(slow_seen.last().unwrap(), "event-9");
}

#[tokio::test]
async fn close_delivers_queued_events_then_ends_stream() {
    let bus = EventBus::new("task-1");
    let mut subscriber = bus.subscribe().unwrap();

    bus.publish(log_event(0));
    bus.publish(log_event(1));
    bus.close();

    assert!(bus.is_closed());
    assert!(bus.subscribe().is_none());

    // Publishing after close is a silent no-op.
    bus.publish(log_event(2));

    assert_eq!(message_of(&subscriber.next_event().await.unwrap().kind), "event-0");
    assert_eq!(message_of(&subscriber.next_event().await.unwrap().kind), "event-1");
    assert!(subscriber.next_event().await.is_none());
}

#[tokio::test]
async fn log_sink_mirrors_log_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("events.log");
    let bus = EventBus::new("task-1").with_log_sink(&path).unwrap();

    bus.publish(log_event(0));
    bus.publish(EventKind::ArtifactCreated {
        name: "report.md".to_string(),
        version: "v1".to_string(),
    });
    bus.publish(log_event(1));

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("event-0"));
    assert!(contents.contains("event-1"));
    // Only log_entry events are mirrored to the sink.
    assert!(!contents.contains("report.md"));
}
