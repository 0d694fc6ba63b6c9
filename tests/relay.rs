use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use pose_relay::{
    FrameCodec,
    pipeline::{FramePacer, FrameSource, SourceSpec, run_stream_loop},
    transport::{Endpoint, Publisher, Subscriber},
};

fn loopback_publisher(high_water_mark: usize) -> (Publisher, Endpoint) {
    let publisher = Publisher::bind(&Endpoint::remote("127.0.0.1", 0), high_water_mark).unwrap();
    let port = publisher.local_addr().unwrap().port();
    (publisher, Endpoint::remote("127.0.0.1", port))
}

fn wait_for_subscribers(publisher: &mut Publisher, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while publisher.subscriber_count() < count && Instant::now() < deadline {
        publisher.accept_pending();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(publisher.subscriber_count(), count);
}

#[test]
fn noise_stream_publishes_at_ten_hertz() {
    let (mut publisher, endpoint) = loopback_publisher(4);
    let subscriber = Subscriber::connect(&endpoint, 32).unwrap();

    let mut source = FrameSource::open(&SourceSpec::Noise, 160, 120).unwrap();
    let codec = FrameCodec::default();
    let mut pacer = FramePacer::new(10.0);

    let stop = Arc::new(AtomicBool::new(false));
    let timer = {
        let stop = stop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(1_000));
            stop.store(true, Ordering::SeqCst);
        })
    };

    let stats = run_stream_loop(&mut source, &codec, &mut publisher, &mut pacer, &stop).unwrap();
    timer.join().unwrap();

    assert!(
        (9..=11).contains(&stats.published),
        "published {} frames in one second",
        stats.published
    );
    assert_eq!(stats.failed, 0);

    let first = subscriber.recv_timeout(Duration::from_secs(2)).unwrap();
    let frame = codec.decode(&first).unwrap();
    assert_eq!((frame.width, frame.height), (160, 120));
}

#[test]
fn every_subscriber_gets_each_message_in_order() {
    let (mut publisher, endpoint) = loopback_publisher(16);
    let a = Subscriber::connect(&endpoint, 16).unwrap();
    let b = Subscriber::connect(&endpoint, 16).unwrap();
    wait_for_subscribers(&mut publisher, 2);

    for i in 0u8..5 {
        assert_eq!(publisher.publish(&[i; 64]), 2);
    }

    for subscriber in [&a, &b] {
        let received: Vec<u8> = (0..5)
            .map(|_| subscriber.recv_timeout(Duration::from_secs(2)).unwrap()[0])
            .collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }
}

#[test]
fn late_subscriber_only_sees_later_messages() {
    let (mut publisher, endpoint) = loopback_publisher(4);
    publisher.publish(b"before anyone listened");

    let late = Subscriber::connect(&endpoint, 4).unwrap();
    wait_for_subscribers(&mut publisher, 1);
    publisher.publish(b"after");

    assert_eq!(late.recv_timeout(Duration::from_secs(2)).unwrap(), b"after");
    assert!(late.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn publishing_never_waits_for_a_slow_subscriber() {
    let (mut publisher, _) = loopback_publisher(1);
    // Connected but never reading, so socket buffers fill up.
    let _idle = std::net::TcpStream::connect(publisher.local_addr().unwrap()).unwrap();
    wait_for_subscribers(&mut publisher, 1);

    let payload = vec![0u8; 1 << 20];
    let started = Instant::now();
    for _ in 0..64 {
        publisher.publish(&payload);
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(publisher.stats().dropped > 0);
}
