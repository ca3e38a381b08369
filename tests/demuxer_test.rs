//! Demuxer lifecycle integration tests: initialization across sources,
//! seeking, end of stream, duration and error reporting.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use assert_matches::assert_matches;
use common::*;
use mediasource::ms_core::Ranges;
use mediasource::ms_parser::Liveness;
use mediasource::{
    AddStatus, ChunkDemuxer, DemuxerConfig, DemuxerState, Error, MediaKind, MediaTime,
    PipelineStatus, ReadResult, SourceId,
};

fn ranges(pairs: &[(i64, i64)]) -> Ranges<MediaTime> {
    pairs.iter().map(|&(s, e)| (ms(s), ms(e))).collect()
}

// ---------------------------------------------------------------------------
// Sources and initialization
// ---------------------------------------------------------------------------

#[test]
fn add_id_statuses() {
    let h = Harness::new();
    assert_eq!(h.demuxer.add_id("x", "video/unknown", &[H264]), AddStatus::NotSupported);
    assert_eq!(h.add("x", &["vp09.00.10.08"]), AddStatus::NotSupported);
    assert_eq!(h.add("x", &[]), AddStatus::NotSupported);

    assert_eq!(h.add("audio", &[AAC]), AddStatus::Ok);
    assert_eq!(h.add("audio2", &[OPUS]), AddStatus::ReachedIdLimit);
    assert_eq!(h.add("video", &[H264]), AddStatus::Ok);
    assert_eq!(h.add("muxed", &[AAC, H264]), AddStatus::ReachedIdLimit);
}

#[test]
fn sources_cannot_be_added_after_initialization() {
    let h = Harness::initialized("a", Init::audio());
    assert_eq!(h.add("v", &[H264]), AddStatus::ReachedIdLimit);
}

#[test]
fn initialization_waits_for_every_source() {
    let h = Harness::new();
    assert_eq!(h.add("audio", &[AAC]), AddStatus::Ok);
    assert_eq!(h.add("video", &[H264]), AddStatus::Ok);

    h.append("audio", &Init::audio().bytes()).unwrap();
    assert_eq!(h.take_init_status(), None);
    assert_eq!(h.demuxer.state(), DemuxerState::Initializing);
    assert!(h.demuxer.get_stream(MediaKind::Audio).is_some());

    h.append("video", &Init::video().bytes()).unwrap();
    assert_eq!(h.take_init_status(), Some(PipelineStatus::Ok));
    assert_eq!(h.demuxer.state(), DemuxerState::Initialized);
    assert_eq!(h.demuxer.get_duration(), MediaTime::INFINITE);
    assert!(h.host.durations.lock().is_empty());
    assert_eq!(h.demuxer.get_start_time(), MediaTime::ZERO);
    assert_eq!(h.demuxer.liveness(), Liveness::Unknown);
}

#[test]
fn init_segment_callback_runs_per_init_segment() {
    let h = Harness::new();
    h.add("a", &[AAC]);
    let count = Arc::new(AtomicUsize::new(0));
    let mut offset = MediaTime::ZERO;
    let mut bytes = Init::audio().bytes();
    bytes.extend(Init::audio().bytes());

    let seen = Arc::clone(&count);
    h.demuxer
        .append_data(
            &SourceId::new("a"),
            &bytes,
            MediaTime::ZERO,
            MediaTime::INFINITE,
            &mut offset,
            move || {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(h.take_init_status(), Some(PipelineStatus::Ok));
}

#[test]
fn declared_duration_reaches_host() {
    let init = Init {
        duration_ms: Some(10_000),
        ..Init::audio()
    };
    let h = Harness::initialized("a", init);
    assert_eq!(h.demuxer.get_duration(), MediaTime::from_secs(10));
    assert_eq!(h.demuxer.duration_secs(), 10.0);
    assert_eq!(h.host.durations.lock().as_slice(), &[MediaTime::from_secs(10)]);
}

#[test]
fn appends_past_duration_extend_it() {
    let init = Init {
        duration_ms: Some(50),
        ..Init::audio()
    };
    let h = Harness::initialized("a", init);
    h.append("a", &media(&audio_run(0, 10, 10))).unwrap();
    assert_eq!(h.demuxer.get_duration(), ms(100));
    assert_eq!(h.host.durations.lock().as_slice(), &[ms(50), ms(100)]);
}

#[test]
fn timeline_offsets_must_agree() {
    let h = Harness::new();
    h.add("a", &[AAC]);
    h.add("v", &[H264]);
    let audio_init = Init {
        timeline_offset_secs: Some(100),
        ..Init::audio()
    };
    let video_init = Init {
        timeline_offset_secs: Some(200),
        ..Init::video()
    };

    h.append("a", &audio_init.bytes()).unwrap();
    assert_eq!(
        h.demuxer.get_timeline_offset(),
        Some(SystemTime::UNIX_EPOCH + Duration::from_secs(100))
    );
    let err = h.append("v", &video_init.bytes()).unwrap_err();
    assert_matches!(err, Error::ConfigMismatch(_));
    assert_eq!(h.take_init_status(), Some(PipelineStatus::DemuxerCouldNotOpen));
    assert_eq!(h.demuxer.state(), DemuxerState::ParseError);
}

#[test]
fn parse_error_during_init_fails_initialization() {
    let h = Harness::new();
    h.add("a", &[AAC]);
    let err = h.append("a", &[b'Z', 0, 0, 0, 0]).unwrap_err();
    assert_matches!(err, Error::Parse(_));
    assert_eq!(h.take_init_status(), Some(PipelineStatus::DecodeError));
    assert!(h.host.errors.lock().is_empty());

    // Later appends are ignored.
    h.append("a", &Init::audio().bytes()).unwrap();
    assert_eq!(h.demuxer.state(), DemuxerState::ParseError);
}

#[test]
fn end_of_stream_during_init_fails_initialization() {
    let h = Harness::new();
    h.add("a", &[AAC]);
    h.demuxer.mark_end_of_stream(PipelineStatus::Ok);
    assert_eq!(h.take_init_status(), Some(PipelineStatus::DemuxerCouldNotOpen));
}

#[test]
fn append_before_initialize_is_rejected() {
    let demuxer = ChunkDemuxer::new(DemuxerConfig::default(), registry());
    demuxer.add_id("a", MIME, &[AAC]);
    let mut offset = MediaTime::ZERO;
    let err = demuxer
        .append_data(
            &SourceId::new("a"),
            &Init::audio().bytes(),
            MediaTime::ZERO,
            MediaTime::INFINITE,
            &mut offset,
            || {},
        )
        .unwrap_err();
    assert_matches!(err, Error::InvalidState(_));
}

// ---------------------------------------------------------------------------
// Config changes
// ---------------------------------------------------------------------------

#[test]
fn codec_change_is_rejected_until_reset() {
    let h = Harness::initialized("a", Init::audio());
    let id = SourceId::new("a");
    let opus = Init {
        opus: true,
        ..Init::audio()
    };

    let err = h.append("a", &opus.bytes()).unwrap_err();
    assert_matches!(err, Error::ConfigMismatch(_));
    assert_eq!(h.demuxer.state(), DemuxerState::Initialized);
    assert!(h.host.errors.lock().is_empty());

    let err = h.append("a", &media(&[audio(0, 10)])).unwrap_err();
    assert_matches!(err, Error::InvalidState(_));

    let mut offset = MediaTime::ZERO;
    h.demuxer
        .reset_parser_state(&id, MediaTime::ZERO, MediaTime::INFINITE, &mut offset)
        .unwrap();
    h.append("a", &media(&[audio(0, 10)])).unwrap();
    assert_eq!(h.read_pts(MediaKind::Audio, 1), vec![0]);
}

#[test]
fn track_presence_change_is_a_mismatch() {
    let h = Harness::initialized("av", Init::av());
    let err = h.append("av", &Init::audio().bytes()).unwrap_err();
    assert_matches!(err, Error::ConfigMismatch(_));
    assert_eq!(h.demuxer.state(), DemuxerState::Initialized);
}

#[test]
fn repeated_init_segment_keeps_streams() {
    let h = Harness::initialized("a", Init::audio());
    let stream = h.stream(MediaKind::Audio);
    h.append("a", &media(&audio_run(0, 2, 10))).unwrap();
    h.append("a", &Init::audio().bytes()).unwrap();
    h.append("a", &media(&audio_run(20, 2, 10))).unwrap();

    assert!(Arc::ptr_eq(&stream, &h.stream(MediaKind::Audio)));
    assert_eq!(h.read_pts(MediaKind::Audio, 4), vec![0, 10, 20, 30]);
}

// ---------------------------------------------------------------------------
// Seeking
// ---------------------------------------------------------------------------

#[test]
fn seek_waits_for_data() {
    let h = Harness::initialized("a", Init::audio());
    h.append("a", &media(&audio_run(0, 10, 10))).unwrap();

    let (cb, status) = status_channel();
    h.demuxer.start_waiting_for_seek(ms(500));
    h.demuxer.seek(ms(500), cb);
    assert!(status.try_recv().is_err());

    h.append("a", &media(&audio_run(500, 3, 10))).unwrap();
    assert_eq!(status.try_recv().ok(), Some(PipelineStatus::Ok));
    assert_eq!(h.read_pts(MediaKind::Audio, 3), vec![500, 510, 520]);
}

#[test]
fn seek_into_buffered_data_completes_immediately() {
    let h = Harness::initialized("a", Init::audio());
    h.append("a", &media(&audio_run(0, 10, 10))).unwrap();

    let (cb, status) = status_channel();
    h.demuxer.start_waiting_for_seek(ms(45));
    h.demuxer.seek(ms(45), cb);
    assert_eq!(status.try_recv().ok(), Some(PipelineStatus::Ok));
    assert_eq!(h.read_pts(MediaKind::Audio, 1), vec![50]);
}

#[test]
fn seek_starts_at_the_next_video_keyframe() {
    let h = Harness::initialized("v", Init::video());
    h.append("v", &media(&video_run(0, 12, 20, 4))).unwrap();

    let (cb, status) = status_channel();
    h.demuxer.start_waiting_for_seek(ms(90));
    h.demuxer.seek(ms(90), cb);
    assert_eq!(status.try_recv().ok(), Some(PipelineStatus::Ok));
    assert_eq!(h.read_pts(MediaKind::Video, 2), vec![160, 180]);
}

#[test]
fn negative_seek_starts_from_zero() {
    let h = Harness::initialized("a", Init::audio());
    h.append("a", &media(&audio_run(0, 10, 10))).unwrap();

    let (cb, status) = status_channel();
    h.demuxer.start_waiting_for_seek(ms(-20));
    h.demuxer.seek(ms(-20), cb);
    assert_eq!(status.try_recv().ok(), Some(PipelineStatus::Ok));
    assert_eq!(h.read_pts(MediaKind::Audio, 1), vec![0]);
}

#[test]
fn start_waiting_for_seek_aborts_reads() {
    let h = Harness::initialized("a", Init::audio());
    let pending = read_later(&h.stream(MediaKind::Audio));
    h.demuxer.start_waiting_for_seek(ms(100));
    assert_matches!(pending.try_recv(), Ok(ReadResult::Aborted));
}

#[test]
fn cancel_pending_seek_completes_it() {
    let h = Harness::initialized("a", Init::audio());
    let (cb, status) = status_channel();
    h.demuxer.start_waiting_for_seek(ms(500));
    h.demuxer.seek(ms(500), cb);
    assert!(status.try_recv().is_err());

    h.demuxer.cancel_pending_seek(ms(700));
    assert_eq!(status.try_recv().ok(), Some(PipelineStatus::Ok));
}

#[test]
fn cancel_before_seek_skips_the_next_seek() {
    let h = Harness::initialized("a", Init::audio());
    h.demuxer.cancel_pending_seek(ms(500));

    let (cb, status) = status_channel();
    h.demuxer.seek(ms(500), cb);
    assert_eq!(status.try_recv().ok(), Some(PipelineStatus::Ok));
}

#[test]
fn seek_before_initialization_aborts() {
    let h = Harness::new();
    let (cb, status) = status_channel();
    h.demuxer.seek(ms(0), cb);
    assert_eq!(status.try_recv().ok(), Some(PipelineStatus::AbortError));
}

// ---------------------------------------------------------------------------
// End of stream and duration
// ---------------------------------------------------------------------------

#[test]
fn end_of_stream_extends_ranges_and_shrinks_duration() {
    let h = Harness::initialized("av", Init::av());
    let id = SourceId::new("av");
    let mut frames = audio_run(0, 10, 10);
    frames.extend(video_run(0, 4, 20, 4));
    h.append("av", &media(&frames)).unwrap();
    assert_eq!(h.demuxer.get_buffered_ranges(&id).unwrap(), ranges(&[(0, 80)]));

    h.demuxer.mark_end_of_stream(PipelineStatus::Ok);
    assert_eq!(h.demuxer.state(), DemuxerState::Ended);
    assert_eq!(h.demuxer.get_buffered_ranges(&id).unwrap(), ranges(&[(0, 100)]));
    assert_eq!(h.demuxer.get_duration(), ms(100));
    assert_eq!(h.host.durations.lock().last(), Some(&ms(100)));

    assert_eq!(h.read_pts(MediaKind::Video, 4), vec![0, 20, 40, 60]);
    let end = assert_matches!(h.read(MediaKind::Video), Some(ReadResult::Ok(b)) => b);
    assert!(end.is_end_of_stream());

    let err = h.append("av", &media(&[audio(100, 10)])).unwrap_err();
    assert_matches!(err, Error::InvalidState(_));

    h.demuxer.unmark_end_of_stream();
    assert_eq!(h.demuxer.state(), DemuxerState::Initialized);
    h.append("av", &media(&[audio(100, 10)])).unwrap();
}

#[test]
fn end_of_stream_completes_a_waiting_seek() {
    let h = Harness::initialized("a", Init::audio());
    h.append("a", &media(&audio_run(0, 10, 10))).unwrap();

    let (cb, status) = status_channel();
    h.demuxer.start_waiting_for_seek(ms(500));
    h.demuxer.seek(ms(500), cb);
    assert!(status.try_recv().is_err());

    h.demuxer.mark_end_of_stream(PipelineStatus::Ok);
    assert_eq!(status.try_recv().ok(), Some(PipelineStatus::Ok));
}

#[test]
fn end_of_stream_with_error_reports_to_host() {
    let h = Harness::initialized("a", Init::audio());
    let pending = read_later(&h.stream(MediaKind::Audio));

    h.demuxer.mark_end_of_stream(PipelineStatus::NetworkError);
    assert_eq!(h.host.errors.lock().as_slice(), &[PipelineStatus::NetworkError]);
    assert_eq!(h.demuxer.state(), DemuxerState::ParseError);
    let end = assert_matches!(pending.try_recv(), Ok(ReadResult::Ok(b)) => b);
    assert!(end.is_end_of_stream());
}

#[test]
fn set_duration_truncates_buffered_data() {
    let h = Harness::initialized("a", Init::audio());
    let id = SourceId::new("a");
    h.append("a", &media(&audio_run(0, 10, 10))).unwrap();

    h.demuxer.set_duration(0.05);
    assert_eq!(h.demuxer.get_duration(), ms(50));
    assert_eq!(h.demuxer.duration_secs(), 0.05);
    assert_eq!(h.host.durations.lock().as_slice(), &[ms(50)]);
    assert_eq!(h.demuxer.get_buffered_ranges(&id).unwrap(), ranges(&[(0, 50)]));
    assert_eq!(h.demuxer.get_highest_presentation_timestamp(&id).unwrap(), ms(40));
}

// ---------------------------------------------------------------------------
// Removal
// ---------------------------------------------------------------------------

#[test]
fn remove_deletes_an_interval() {
    let h = Harness::initialized("a", Init::audio());
    let id = SourceId::new("a");
    h.append("a", &media(&audio_run(0, 10, 10))).unwrap();

    h.demuxer.remove(&id, ms(30), ms(60)).unwrap();
    assert_eq!(
        h.demuxer.get_buffered_ranges(&id).unwrap(),
        ranges(&[(0, 30), (60, 100)])
    );

    // An empty interval is a no-op.
    h.demuxer.remove(&id, ms(70), ms(70)).unwrap();
    assert_eq!(h.demuxer.get_buffered_ranges(&id).unwrap().len(), 2);
}

#[test]
fn inverted_remove_interval_is_rejected() {
    let h = Harness::initialized("a", Init::audio());
    let id = SourceId::new("a");
    h.append("a", &media(&audio_run(0, 10, 10))).unwrap();

    let err = h.demuxer.remove(&id, ms(60), ms(30)).unwrap_err();
    assert_matches!(err, Error::InvalidState(_));
    assert_eq!(h.demuxer.get_buffered_ranges(&id).unwrap(), ranges(&[(0, 100)]));
}

#[test]
fn buffered_ranges_intersect_across_sources() {
    let h = Harness::new();
    h.add("a", &[AAC]);
    h.add("v", &[H264]);
    h.append("a", &Init::audio().bytes()).unwrap();
    h.append("v", &Init::video().bytes()).unwrap();
    assert_eq!(h.take_init_status(), Some(PipelineStatus::Ok));

    h.append("a", &media(&audio_run(0, 10, 10))).unwrap();
    h.append("v", &media(&video_run(0, 3, 20, 3))).unwrap();
    assert_eq!(h.demuxer.buffered_ranges(), ranges(&[(0, 60)]));
}

#[test]
fn remove_id_drops_streams() {
    let h = Harness::initialized("a", Init::audio());
    let id = SourceId::new("a");
    let pending = read_later(&h.stream(MediaKind::Audio));

    h.demuxer.remove_id(&id).unwrap();
    assert!(h.demuxer.get_stream(MediaKind::Audio).is_none());
    assert_matches!(h.demuxer.get_buffered_ranges(&id), Err(Error::NotFound { .. }));
    assert_matches!(h.demuxer.remove_id(&id), Err(Error::NotFound { .. }));
    let end = assert_matches!(pending.try_recv(), Ok(ReadResult::Ok(b)) => b);
    assert!(end.is_end_of_stream());
}

// ---------------------------------------------------------------------------
// Errors and shutdown
// ---------------------------------------------------------------------------

#[test]
fn parse_error_after_initialization_is_terminal() {
    let h = Harness::initialized("a", Init::audio());
    let pending = read_later(&h.stream(MediaKind::Audio));

    let err = h.append("a", &[b'Z', 0, 0, 0, 0]).unwrap_err();
    assert_matches!(err, Error::Parse(_));
    assert_eq!(h.host.errors.lock().as_slice(), &[PipelineStatus::DecodeError]);
    let end = assert_matches!(pending.try_recv(), Ok(ReadResult::Ok(b)) => b);
    assert!(end.is_end_of_stream());

    // Appends are ignored and seeks abort from now on.
    h.append("a", &media(&[audio(0, 10)])).unwrap();
    let (cb, status) = status_channel();
    h.demuxer.seek(ms(0), cb);
    assert_eq!(status.try_recv().ok(), Some(PipelineStatus::AbortError));
}

#[test]
fn ingestion_calls_are_ignored_after_a_parse_error() {
    let h = Harness::initialized("a", Init::audio());
    let id = SourceId::new("a");
    h.append("a", &media(&audio_run(0, 10, 10))).unwrap();
    h.append("a", &[b'Z', 0, 0, 0, 0]).unwrap_err();
    assert_eq!(h.demuxer.state(), DemuxerState::ParseError);
    let duration = h.demuxer.get_duration();
    let reported = h.host.durations.lock().len();

    h.demuxer.set_duration(0.03);
    assert_eq!(h.demuxer.get_duration(), duration);
    assert_eq!(h.host.durations.lock().len(), reported);

    let mut offset = ms(5);
    h.demuxer
        .reset_parser_state(&id, MediaTime::ZERO, MediaTime::INFINITE, &mut offset)
        .unwrap();
    h.demuxer.set_sequence_mode(&id, true).unwrap();
    h.demuxer
        .set_group_start_timestamp_if_in_sequence_mode(&id, ms(500))
        .unwrap();
    assert!(!h.demuxer.evict_coded_frames(&id, ms(90), 0));
    h.demuxer.remove(&id, ms(0), ms(50)).unwrap();
    h.demuxer.remove_id(&id).unwrap();

    assert_eq!(offset, ms(5));
    assert_eq!(h.demuxer.get_buffered_ranges(&id).unwrap(), ranges(&[(0, 100)]));
    assert_eq!(h.demuxer.state(), DemuxerState::ParseError);
}

#[test]
fn ingestion_calls_are_ignored_after_shutdown() {
    let h = Harness::initialized("a", Init::audio());
    let id = SourceId::new("a");
    h.append("a", &media(&audio_run(0, 10, 10))).unwrap();
    h.demuxer.shutdown();
    let reported = h.host.durations.lock().len();

    h.demuxer.set_duration(0.03);
    assert_eq!(h.host.durations.lock().len(), reported);
    h.demuxer.remove_id(&id).unwrap();
    h.demuxer.set_sequence_mode(&id, true).unwrap();
    assert!(!h.demuxer.evict_coded_frames(&id, ms(90), 0));

    assert_eq!(h.demuxer.get_buffered_ranges(&id).unwrap(), ranges(&[(0, 100)]));
    assert!(h.demuxer.get_stream(MediaKind::Audio).is_some());
}

#[test]
fn invalid_durations_are_ignored() {
    let h = Harness::initialized("a", Init::audio());
    h.append("a", &media(&audio_run(0, 10, 10))).unwrap();
    let duration = h.demuxer.get_duration();

    h.demuxer.set_duration(-1.0);
    h.demuxer.set_duration(f64::NAN);
    assert_eq!(h.demuxer.get_duration(), duration);
}

#[test]
fn shutdown_fails_pending_init() {
    let h = Harness::new();
    h.add("a", &[AAC]);
    h.demuxer.shutdown();
    assert_eq!(h.take_init_status(), Some(PipelineStatus::AbortError));
    assert_eq!(h.demuxer.state(), DemuxerState::Shutdown);

    h.append("a", &Init::audio().bytes()).unwrap();
    h.demuxer.shutdown();
}

#[test]
fn shutdown_ends_latched_reads() {
    let h = Harness::initialized("a", Init::audio());
    let pending = read_later(&h.stream(MediaKind::Audio));
    h.demuxer.shutdown();

    let end = assert_matches!(pending.try_recv(), Ok(ReadResult::Ok(b)) => b);
    assert!(end.is_end_of_stream());
    let again = assert_matches!(h.read(MediaKind::Audio), Some(ReadResult::Ok(b)) => b);
    assert!(again.is_end_of_stream());
}

#[test]
fn initialize_after_shutdown_cannot_open() {
    let demuxer = ChunkDemuxer::new(DemuxerConfig::default(), registry());
    demuxer.shutdown();
    let (cb, status) = status_channel();
    demuxer.initialize(Arc::new(RecordingHost::default()), cb);
    assert_eq!(status.try_recv().ok(), Some(PipelineStatus::DemuxerCouldNotOpen));
}
