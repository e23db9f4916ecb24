//! Progress events emitted during a render.
//!
//! Delivered on an optional `crossbeam_channel::Sender<RenderEvent>`; the
//! serialized form is what a host forwards to a UI or writes as JSON lines.

use serde::{Deserialize, Serialize};

use crate::features::AudioMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RenderEvent {
    /// Inputs validated, frame count fixed.
    #[serde(rename_all = "camelCase")]
    Started {
        total_frames: usize,
        total_batches: usize,
        mode: AudioMode,
        fps: u32,
    },
    /// One batch fully written.
    #[serde(rename_all = "camelCase")]
    BatchCompleted {
        batch: usize,
        frames_done: usize,
        total_frames: usize,
    },
    #[serde(rename_all = "camelCase")]
    Finished { frames: usize, elapsed_ms: u64 },
    /// The run was aborted; `frame` is set for per-frame failures.
    #[serde(rename_all = "camelCase")]
    Failed {
        frame: Option<usize>,
        message: String,
    },
}

/// Current state of the render engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// No render in progress.
    Idle,
    /// Computing mel spectrogram and audio embeddings.
    Extracting,
    /// Generating and writing frames.
    Rendering,
    /// Last render completed.
    Finished,
    /// Last render aborted.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_event_serializes_with_kind_tag_and_camel_case() {
        let event = RenderEvent::Started {
            total_frames: 49,
            total_batches: 2,
            mode: AudioMode::Hubert,
            fps: 25,
        };

        let json = serde_json::to_value(&event).expect("serialize started event");
        assert_eq!(json["kind"], "started");
        assert_eq!(json["totalFrames"], 49);
        assert_eq!(json["totalBatches"], 2);
        assert_eq!(json["mode"], "hubert");

        let round_trip: RenderEvent =
            serde_json::from_value(json).expect("deserialize started event");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn failed_event_carries_optional_frame() {
        let event = RenderEvent::Failed {
            frame: Some(12),
            message: "frame 12 failed during crop".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize failed event");
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["frame"], 12);

        let startup = serde_json::to_value(RenderEvent::Failed {
            frame: None,
            message: "model missing".into(),
        })
        .expect("serialize startup failure");
        assert!(startup["frame"].is_null());
    }

    #[test]
    fn batch_event_uses_camel_case_fields() {
        let json = serde_json::to_value(RenderEvent::BatchCompleted {
            batch: 1,
            frames_done: 64,
            total_frames: 100,
        })
        .expect("serialize batch event");
        assert_eq!(json["kind"], "batchCompleted");
        assert_eq!(json["framesDone"], 64);
    }

    #[test]
    fn engine_status_is_lowercase_and_strict() {
        assert_eq!(
            serde_json::to_value(EngineStatus::Extracting).expect("serialize status"),
            "extracting"
        );
        assert!(serde_json::from_str::<EngineStatus>(r#""Rendering""#).is_err());
    }
}
