//! Benchmarks for the record codec
//!
//! Measures per-record cost on the hot path of every command:
//! - sealing and framing an outbound command
//! - integrity check, tag lookup and decryption of an inbound record
//! - stream reassembly through the frame reader with split reads

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pumplink::codec::{FrameReader, OutboundRecord, PacketCodec};
use pumplink::family::{FamilyDescriptor, presets};
use pumplink::session::Session;
use pumplink::test_utils::established_sessions;
use pumplink::{Command, FrameFlags, Opcode};
use std::hint::black_box;
use std::sync::Arc;

const PAYLOAD_SIZES: [usize; 3] = [8, 32, 96];

fn families() -> Vec<FamilyDescriptor> {
    vec![presets::dana_r(), presets::dana_rs(), presets::patch_pump()]
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_command");

    for family in families() {
        let (host, _pump) = established_sessions(&family);
        let codec = PacketCodec::new(Arc::new(family.clone()));

        for size in PAYLOAD_SIZES {
            let command = Command::new(0x02, vec![0x5A; size]);
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(family.name.as_str(), size), &command, |b, command| {
                b.iter(|| black_box(codec.encode(black_box(command), 7, &host).expect("encodes")))
            });
        }
    }

    group.finish();
}

fn pump_record(codec: &PacketCodec, pump: &Session, size: usize, fragment: u8) -> Vec<u8> {
    let payload = vec![0xC3; size];
    let record = OutboundRecord {
        opcode: Opcode(0x02),
        flags: FrameFlags::new(FrameFlags::FROM_PUMP),
        sequence: 7,
        fragment,
        payload: &payload,
    };
    codec.encode_record(&record, pump.cipher()).expect("encodes")
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_record");

    for family in families() {
        let (host, pump) = established_sessions(&family);
        let codec = PacketCodec::new(Arc::new(family.clone()));

        for size in PAYLOAD_SIZES {
            let bytes = pump_record(&codec, &pump, size, 0);
            group.throughput(Throughput::Bytes(bytes.len() as u64));
            group.bench_with_input(BenchmarkId::new(family.name.as_str(), size), &bytes, |b, bytes| {
                b.iter(|| black_box(codec.decode(black_box(bytes), &host).expect("decodes")))
            });
        }
    }

    group.finish();
}

fn bench_reader(c: &mut Criterion) {
    let family = presets::dana_rs();
    let (host, pump) = established_sessions(&family);
    let codec = PacketCodec::new(Arc::new(family));

    let mut stream = Vec::new();
    for fragment in 0..16 {
        stream.extend(pump_record(&codec, &pump, 64, fragment));
    }

    let mut group = c.benchmark_group("frame_reader");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for chunk in [20usize, 244] {
        group.bench_with_input(BenchmarkId::new("split_reads", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut reader = FrameReader::default();
                let mut frames = 0;
                for piece in stream.chunks(chunk) {
                    reader.push(piece);
                    while let Some(result) = codec.next_frame(&mut reader, &host) {
                        if result.is_ok() {
                            frames += 1;
                        }
                    }
                }
                black_box(frames)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_reader);
criterion_main!(benches);
