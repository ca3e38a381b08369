//! Decode-order merging of per-track buffer queues.

use ms_core::{AccessUnit, DecodeTimestamp, Error, Result};

use crate::parser::{BufferQueue, BufferQueues};

/// Interleave the audio, video and text queues of `queues` into `merged`,
/// lowest decode timestamp first.
///
/// Each input queue must already be in decode order. Ties go to the queue
/// encountered first (audio, then video, then text tracks by id). Merging
/// continues from whatever `merged` already holds; a candidate decoding
/// before the last merged buffer is a hard error and leaves the partial
/// result in `merged`.
pub fn merge_buffer_queues(queues: BufferQueues, merged: &mut Vec<AccessUnit>) -> Result<()> {
    let BufferQueues { audio, video, text } = queues;

    let mut inputs: Vec<BufferQueue> = Vec::with_capacity(2 + text.len());
    inputs.push(audio);
    inputs.push(video);
    inputs.extend(text.into_values());
    inputs.retain(|q| !q.is_empty());

    merged.reserve(inputs.iter().map(|q| q.len()).sum());

    let mut last_decode_timestamp = merged
        .last()
        .map(|b| b.decode_timestamp)
        .unwrap_or(DecodeTimestamp::NONE);

    loop {
        let mut lowest: Option<(usize, DecodeTimestamp)> = None;

        for (i, queue) in inputs.iter().enumerate() {
            let Some(front) = queue.front() else {
                continue;
            };
            let dts = front.decode_timestamp;

            if dts.is_none() || (last_decode_timestamp.is_some() && dts < last_decode_timestamp) {
                tracing::warn!(
                    "Buffer queue merge failed: {} after {}",
                    dts,
                    last_decode_timestamp
                );
                return Err(Error::MergeOrder {
                    last: last_decode_timestamp.to_presentation_time(),
                    candidate: dts.to_presentation_time(),
                });
            }

            match lowest {
                Some((_, lowest_dts)) if dts >= lowest_dts => {}
                _ => lowest = Some((i, dts)),
            }
        }

        let Some((index, dts)) = lowest else {
            return Ok(());
        };

        if let Some(buffer) = inputs[index].pop_front() {
            last_decode_timestamp = dts;
            merged.push(buffer);
        }
    }
}
