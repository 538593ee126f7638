// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Criterion benchmarks for the hot pure paths: control-word codec, data
// headers and the event byte ring.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use libcmtspeech::msgs::{CmtCmd, DlFrameHeader, Message, UlFrameHeader};
use libcmtspeech::ring::RingBuffer;

fn bench_codec(c: &mut Criterion) {
    c.bench_function("encode_speech_config_req", |b| {
        let msg = Message::SpeechConfigReq {
            speech_data_stream: 1,
            call_user_connecting_ind: 0,
            codec_info: 11,
            cellular_info: 1,
            sample_rate: 2,
            data_format: 1,
        };
        b.iter(|| black_box(msg).encode())
    });

    c.bench_function("decode_speech_config_req", |b| {
        let cmd = CmtCmd::from_logical([0x31, 0x00, 0x2a, 0xd5]);
        b.iter(|| Message::decode(black_box(cmd)))
    });

    c.bench_function("ul_header_encode", |b| {
        let hdr = UlFrameHeader {
            frame_counter: 0xabcd,
            data_length: 2,
            sample_rate: 2,
            data_type: 2,
        };
        let mut buf = [0u8; 4];
        b.iter(|| hdr.encode(black_box(&mut buf)))
    });

    c.bench_function("dl_header_decode", |b| {
        let cmd = CmtCmd::from_logical([0xab, 0xcd, 0x10, 0xa9]);
        let buf = cmd.wire_bytes();
        b.iter(|| DlFrameHeader::decode(black_box(&buf)))
    });
}

fn bench_ring(c: &mut Criterion) {
    c.bench_function("ring_move_cycle", |b| {
        let mut ring = RingBuffer::new(4096);
        b.iter(|| {
            ring.move_write(black_box(64));
            ring.move_read(black_box(64));
            ring.avail_for_read()
        })
    });
}

criterion_group!(benches, bench_codec, bench_ring);
criterion_main!(benches);
