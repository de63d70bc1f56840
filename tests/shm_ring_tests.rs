use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use plugin_supervisor::shm::SharedMemorySegment;

const FRAMES: u32 = 20_000;

fn payload(n: u32) -> Vec<u8> {
    // Varying lengths so frames keep straddling the end of the ring.
    let len = 1 + (n as usize * 7) % 200;
    let mut bytes = n.to_le_bytes().to_vec();
    bytes.resize(len.max(4), (n % 251) as u8);
    bytes
}

#[test]
fn test_writer_and_reader_on_separate_mappings() {
    let dir = TempDir::new().unwrap();
    let owner = SharedMemorySegment::create(&dir.path().join("ring.shm"), "stress", 1024).unwrap();
    let writer = SharedMemorySegment::open(&owner.descriptor()).unwrap();
    let reader = Arc::new(SharedMemorySegment::open(&owner.descriptor()).unwrap());

    let producer = thread::spawn(move || {
        let mut full_hits = 0u64;
        for n in 0..FRAMES {
            let frame = payload(n);
            loop {
                match writer.try_write_frame(&frame).unwrap() {
                    Some(_) => break,
                    None => {
                        full_hits += 1;
                        thread::yield_now();
                    }
                }
            }
        }
        full_hits
    });

    let consumer = {
        let reader = reader.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(30);
            let mut received = 0u32;
            while received < FRAMES {
                assert!(Instant::now() < deadline, "reader stalled at frame {received}");
                match reader.try_read_frame() {
                    Some(frame) => {
                        assert_eq!(frame, payload(received), "frame {received} mismatched");
                        received += 1;
                    }
                    None => thread::yield_now(),
                }
            }
            received
        })
    };

    let full_hits = producer.join().unwrap();
    assert_eq!(consumer.join().unwrap(), FRAMES);
    assert!(full_hits > 0, "a 1 KiB ring should have filled up at least once");

    assert_eq!(reader.corrupt_frames(), 0);
    let stats = owner.statistics();
    assert_eq!(stats.used, 0);
    assert_eq!(stats.total_frames, FRAMES as u64);
    assert!(reader.try_read_frame().is_none());
}

#[test]
fn test_mappings_agree_on_fill_ratio() {
    let dir = TempDir::new().unwrap();
    let owner = SharedMemorySegment::create(&dir.path().join("ring.shm"), "fill", 1000).unwrap();
    let peer = SharedMemorySegment::open(&owner.descriptor()).unwrap();

    // 5 frames of 4 + 96 bytes.
    for _ in 0..5 {
        peer.try_write_frame(&[7u8; 96]).unwrap().unwrap();
    }
    assert!((owner.fill_ratio() - 0.5).abs() < f64::EPSILON);
    assert!((peer.fill_ratio() - 0.5).abs() < f64::EPSILON);

    owner.try_read_frame().unwrap();
    assert!((peer.fill_ratio() - 0.4).abs() < 1e-9);
}
