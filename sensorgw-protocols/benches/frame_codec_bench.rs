#[macro_use]
extern crate criterion;

use bytes::BytesMut;
use criterion::{black_box, Criterion, Throughput};

use sensorgw_protocols::{echo, mqtt, sensor, SensorFrame};

fn sensor_stream(frames: usize, garbage_every: usize) -> BytesMut {
    let mut buf = BytesMut::new();
    for i in 0..frames {
        if garbage_every > 0 && i % garbage_every == 0 {
            buf.extend_from_slice(&[0xFF]);
        }
        SensorFrame::new(i as u8, 2000 + i as u16, 5000, 0).encode(&mut buf);
    }
    buf
}

fn bench_sensor_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("sensor_frames");

    for (name, garbage_every) in [("clean", 0usize), ("resync", 8)] {
        let stream = sensor_stream(1024, garbage_every);
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut buf = stream.clone();
                while buf.len() >= sensor::FRAME_LEN {
                    black_box(sensor::next_step(&mut buf));
                }
            });
        });
    }
    group.finish();
}

fn bench_echo_and_mqtt(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    let mut echo_stream = BytesMut::new();
    for _ in 0..256 {
        echo::encode_frame(&[0xAB; 64], &mut echo_stream);
    }
    group.bench_function("echo_extract", |b| {
        b.iter(|| {
            let mut buf = echo_stream.clone();
            while let Ok(Some(payload)) = echo::next_frame(&mut buf, echo::MAX_ECHO_FRAME) {
                black_box(payload);
            }
        });
    });

    let payload = br#"{"dev_id":3,"temp":25.5,"humi":60,"gw_id":1}"#;
    group.bench_function("mqtt_publish_roundtrip", |b| {
        b.iter(|| {
            let mut dst = BytesMut::with_capacity(64);
            mqtt::encode_publish("sensor/data", payload, 0, false, 0, &mut dst).unwrap();
            black_box(mqtt::decode(&dst).unwrap());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_sensor_frames, bench_echo_and_mqtt);
criterion_main!(benches);
