//! Benchmarks for the append path
//!
//! Measures byte queue churn, decode-order merging and frame processing into
//! track stores, the per-append costs paid before any buffer is read.

use std::collections::VecDeque;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use mediasource::ms_core::{
    AccessUnit, AudioCodec, AudioDecoderConfig, MediaKind, MediaTime, TrackId, VideoCodec,
    VideoDecoderConfig,
};
use mediasource::ms_parser::{merge_buffer_queues, BufferQueues, ByteQueue};
use mediasource::ms_stream::{run_completions, AppendContext, FrameProcessor};
use mediasource::DemuxerStream;

/// 10 ms audio frames and 40 ms video frames covering `secs` seconds,
/// video with a key frame every second.
fn segment(secs: i64) -> BufferQueues {
    let audio: VecDeque<_> = (0..secs * 100)
        .map(|i| {
            AccessUnit::new(
                MediaKind::Audio,
                TrackId::AUDIO,
                true,
                vec![0u8; 256],
                MediaTime::from_millis(i * 10),
                MediaTime::from_millis(10),
            )
        })
        .collect();
    let video: VecDeque<_> = (0..secs * 25)
        .map(|i| {
            AccessUnit::new(
                MediaKind::Video,
                TrackId::VIDEO,
                i % 25 == 0,
                vec![0u8; 4096],
                MediaTime::from_millis(i * 40),
                MediaTime::from_millis(40),
            )
        })
        .collect();
    BufferQueues {
        audio,
        video,
        ..Default::default()
    }
}

fn merged(secs: i64) -> Vec<AccessUnit> {
    let mut frames = Vec::new();
    merge_buffer_queues(segment(secs), &mut frames).unwrap();
    frames
}

/// A processor wired to fresh audio and video streams.
fn processor() -> (FrameProcessor, Arc<DemuxerStream>, Arc<DemuxerStream>) {
    let audio_config = AudioDecoderConfig::new(AudioCodec::Aac, 48_000, 2);
    let audio = DemuxerStream::new(TrackId::AUDIO, audio_config.clone().into(), usize::MAX, false);
    let video = DemuxerStream::new(
        TrackId::VIDEO,
        VideoDecoderConfig::new(VideoCodec::H264, 1920, 1080).into(),
        usize::MAX,
        false,
    );
    let mut processor = FrameProcessor::new();
    processor.add_track(TrackId::AUDIO, &audio);
    processor.add_track(TrackId::VIDEO, &video);
    processor.on_possible_audio_config_update(&audio_config);
    (processor, audio, video)
}

fn bench_byte_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("byte_queue");

    // Transport-stream sized pushes, consumed a record at a time.
    for chunk in [188usize, 4096, 65536] {
        let data = vec![0xABu8; chunk];
        group.bench_with_input(BenchmarkId::new("push_pop", chunk), &data, |b, data| {
            let mut queue = ByteQueue::new();
            b.iter(|| {
                for _ in 0..16 {
                    queue.push(black_box(data));
                }
                while queue.len() >= 1000 {
                    queue.pop(1000);
                }
            });
        });
    }

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_buffer_queues");

    for secs in [1i64, 10] {
        group.bench_with_input(BenchmarkId::new("audio_video", secs), &secs, |b, &secs| {
            b.iter_batched(
                || segment(secs),
                |queues| {
                    let mut frames = Vec::new();
                    merge_buffer_queues(black_box(queues), &mut frames).unwrap();
                    frames
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_process_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_frames");

    for secs in [1i64, 10] {
        group.bench_with_input(BenchmarkId::new("contiguous", secs), &secs, |b, &secs| {
            b.iter_batched(
                || (processor(), merged(secs)),
                |((mut processor, _audio, _video), frames)| {
                    let mut ctx = AppendContext::unbounded();
                    let end = processor.process_frames(black_box(frames), &mut ctx).unwrap();
                    run_completions(ctx.take_completions());
                    end
                },
                BatchSize::SmallInput,
            );
        });
    }

    // Every append lands on top of what is already buffered.
    group.bench_function("overwrite/1", |b| {
        b.iter_batched(
            || {
                let (mut processor, audio, video) = processor();
                let mut ctx = AppendContext::unbounded();
                processor.process_frames(merged(1), &mut ctx).unwrap();
                processor.reset();
                ((processor, audio, video), merged(1))
            },
            |((mut processor, _audio, _video), frames)| {
                let mut ctx = AppendContext::unbounded();
                processor.process_frames(black_box(frames), &mut ctx).unwrap()
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_byte_queue, bench_merge, bench_process_frames);
criterion_main!(benches);
