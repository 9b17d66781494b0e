//! Run metadata and the human-readable diagnostics report.
//!
//! Every pipeline run records which stages executed or were skipped,
//! how long each executed stage took, and the aggregate quality and
//! confidence scores. [`PipelineResult::report`] formats all of it for
//! the `cie-bench` CLI.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineResult;
use crate::types::PipelineStage;

/// Serde support for `std::time::Duration` as fractional seconds.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Serde support for per-stage durations as a map of fractional seconds.
mod stage_times_serde {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::types::PipelineStage;

    pub fn serialize<S: Serializer>(
        times: &BTreeMap<PipelineStage, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        times
            .iter()
            .map(|(stage, d)| (*stage, d.as_secs_f64()))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<PipelineStage, Duration>, D::Error> {
        BTreeMap::<PipelineStage, f64>::deserialize(deserializer)?
            .into_iter()
            .map(|(stage, secs)| {
                Duration::try_from_secs_f64(secs)
                    .map(|d| (stage, d))
                    .map_err(|_| serde::de::Error::custom(format!("invalid duration for {stage}")))
            })
            .collect()
    }
}

/// Bookkeeping for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetadata {
    /// Processing stages that ran, in execution order.
    pub executed_stages: BTreeSet<PipelineStage>,
    /// Processing stages disabled by options.
    pub skipped_stages: BTreeSet<PipelineStage>,
    /// Wall-clock time per executed stage (seconds).
    #[serde(with = "stage_times_serde")]
    pub stage_times: BTreeMap<PipelineStage, Duration>,
    /// Weighted mean of the available stage scores, 0–100.
    pub overall_quality_score: f64,
    /// Mean of the available stage confidences, 0–1.
    pub overall_confidence: f64,
}

impl PipelineMetadata {
    /// Record a completed stage and its duration.
    pub fn record_stage(&mut self, stage: PipelineStage, duration: Duration) {
        self.executed_stages.insert(stage);
        self.stage_times.insert(stage, duration);
    }

    pub fn record_skip(&mut self, stage: PipelineStage) {
        self.skipped_stages.insert(stage);
    }

    #[must_use]
    pub fn was_executed(&self, stage: PipelineStage) -> bool {
        self.executed_stages.contains(&stage)
    }

    #[must_use]
    pub fn was_skipped(&self, stage: PipelineStage) -> bool {
        self.skipped_stages.contains(&stage)
    }

    /// Sum of recorded stage durations.
    #[must_use]
    pub fn stage_time_total(&self) -> Duration {
        self.stage_times.values().sum()
    }
}

impl PipelineResult {
    /// Format the run as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("CIE Pipeline Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} ({} pixels)",
            self.dimensions.width,
            self.dimensions.height,
            self.dimensions.pixel_count(),
        ));
        let status = match &self.rejection {
            Some(reason) if !self.success() => format!("{} ({reason})", self.stage),
            Some(reason) => format!("{} with warning: {reason}", self.stage),
            None => self.stage.to_string(),
        };
        lines.push(format!("Status: {status}"));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_processing_time),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<8} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_processing_time);
        for stage in PipelineStage::PROCESSING {
            let details = self.stage_details(stage);
            if let Some(d) = self.metadata.stage_times.get(&stage) {
                let ms = duration_ms(*d);
                let pct = if total_ms > 0.0 {
                    ms / total_ms * 100.0
                } else {
                    0.0
                };
                lines.push(format!("{stage:<8} {ms:>8.3}ms {pct:>9.1}%  {details}"));
            } else if self.metadata.was_skipped(stage) {
                lines.push(format!("{stage:<8} {:>10} {:>10}  skipped", "-", "-"));
            } else {
                lines.push(format!("{stage:<8} {:>10} {:>10}  not reached", "-", "-"));
            }
        }

        lines.push(String::new());
        lines.push(format!(
            "Overall quality: {:.1}  |  Confidence: {:.2}  |  Suitable for analysis: {}",
            self.metadata.overall_quality_score,
            self.metadata.overall_confidence,
            if self.is_suitable_for_analysis { "yes" } else { "no" },
        ));

        let feedback = self.feedback();
        if !feedback.is_empty() {
            lines.push(String::new());
            lines.push("Feedback:".to_owned());
            lines.extend(feedback.iter().map(|f| format!("  - {f}")));
        }

        lines.join("\n")
    }

    /// Compact per-stage detail string.
    fn stage_details(&self, stage: PipelineStage) -> String {
        match stage {
            PipelineStage::Cie1 => self.cie1.as_ref().map_or_else(String::new, |q| {
                format!(
                    "score={:.1} sharp={:.1} bright={:.1} cct={:.0}K ({:?})",
                    q.overall_score, q.sharpness, q.brightness, q.cct.cct, q.cct.verdict,
                )
            }),
            PipelineStage::Cie2 => self.cie2.as_ref().map_or_else(String::new, |d| {
                let (pitch, yaw, roll) = d.face.angle.to_degrees();
                format!(
                    "faces={} frontality={:.1} pitch={pitch:.1} yaw={yaw:.1} roll={roll:.1} roi={}x{}@{},{}",
                    d.face_count,
                    d.face.frontality_score,
                    d.roi.width,
                    d.roi.height,
                    d.roi.x,
                    d.roi.y,
                )
            }),
            PipelineStage::Cie3 => self.cie3.as_ref().map_or_else(String::new, |w| {
                let after = w
                    .corrected_cct
                    .map_or_else(|| "?".to_owned(), |c| format!("{c:.0}"));
                format!(
                    "{} gains=({:.3},{:.3},{:.3}) cct={:.0}K->{after}K conf={:.2}",
                    w.method, w.gains.r, w.gains.g, w.gains.b, w.original_cct, w.confidence,
                )
            }),
            PipelineStage::Cie4 => self.cie4.as_ref().map_or_else(String::new, |l| {
                format!(
                    "score={:.1} exposure={:.1} uniformity={:.1} clipped={:.1}%",
                    l.overall_score,
                    l.exposure_score,
                    l.uniformity_score,
                    l.clipping_ratio * 100.0,
                )
            }),
            PipelineStage::Complete | PipelineStage::Failed => String::new(),
        }
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
pub(crate) fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn duration_ms_converts_correctly() {
        let d = Duration::from_millis(1234);
        let ms = duration_ms(d);
        assert!((ms - 1234.0).abs() < 0.01);
    }

    #[test]
    fn record_stage_updates_sets_and_times() {
        let mut meta = PipelineMetadata::default();
        meta.record_stage(PipelineStage::Cie2, Duration::from_millis(3));
        meta.record_skip(PipelineStage::Cie1);
        assert!(meta.was_executed(PipelineStage::Cie2));
        assert!(meta.was_skipped(PipelineStage::Cie1));
        assert!(!meta.stage_times.contains_key(&PipelineStage::Cie1));
        assert_eq!(meta.stage_time_total(), Duration::from_millis(3));
    }

    #[test]
    fn stage_times_serialize_as_seconds() {
        let mut meta = PipelineMetadata::default();
        meta.record_stage(PipelineStage::Cie3, Duration::from_millis(250));
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["stage_times"]["cie3"], serde_json::json!(0.25));
        assert_eq!(json["executed_stages"], serde_json::json!(["cie3"]));

        let back: PipelineMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn negative_stage_time_is_rejected() {
        let json = serde_json::json!({
            "executed_stages": [],
            "skipped_stages": [],
            "stage_times": { "cie1": -1.0 },
            "overall_quality_score": 0.0,
            "overall_confidence": 0.0,
        });
        assert!(serde_json::from_value::<PipelineMetadata>(json).is_err());
    }
}
