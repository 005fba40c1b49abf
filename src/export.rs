//! Episode export: per-frame CSV plus a globals JSON document.
//!
//! Exports are derived exclusively from canonical records, which is what
//! makes them byte-identical across peers: all parity columns (`t`,
//! `episode_num`, actions, rewards, termination and truncation flags) come
//! from promoted records, and promotion only happens after confirmation.
//! The local-only columns (`wasSpeculative`, `rollbackEvents`) legitimately
//! differ between peers and document each side's network experience.
//!
//! Layout on disk, one pair of files per participant and episode:
//!
//! ```text
//! data/{experiment_id}/{scene_id}/{participant_id}_ep{episode}.csv
//! data/{experiment_id}/{scene_id}/{participant_id}_globals.json
//! ```

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::TerminationReason;
use crate::hasher::DesyncEvent;
use crate::network::stats::RttSummary;
use crate::recorder::StepRecord;
use crate::telemetry::Counters;
use crate::{ParticipantId, ParticipantIndex, SessionId};

/// Errors produced while rendering or writing an export.
#[derive(Debug)]
#[non_exhaustive]
pub enum ExportError {
    /// Filesystem failure.
    Io(std::io::Error),
    /// JSON serialization failure.
    Serialize(serde_json::Error),
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "export io failure: {err}"),
            Self::Serialize(err) => write!(f, "export serialization failure: {err}"),
        }
    }
}

impl Error for ExportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Serialize(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(err)
    }
}

/// Everything an engine emits at an episode boundary.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeData {
    /// The session this episode ran in.
    pub session: SessionId,
    /// The exporting participant.
    pub participant: ParticipantId,
    /// The exporting participant's slot.
    pub participant_index: ParticipantIndex,
    /// Episode number within the session, starting at 0.
    pub episode: u32,
    /// The session seed.
    pub seed: u32,
    /// Participant slots present in the episode, in column order.
    pub indices: Vec<ParticipantIndex>,
    /// Canonical per-frame records, sorted by frame.
    pub records: Vec<StepRecord>,
    /// Engine health counters over the episode.
    pub counters: Counters,
    /// Per-peer RTT summary, when pings completed.
    pub rtt: BTreeMap<ParticipantIndex, Option<RttSummary>>,
    /// Desyncs recorded during the episode.
    pub desyncs: Vec<DesyncEvent>,
    /// Why the episode (or session) ended.
    pub termination: TerminationReason,
    /// `true` when the session ended before the episode completed; the
    /// records cover only the confirmed prefix.
    pub partial: bool,
}

/// Builds the canonical file path of an episode CSV.
#[must_use]
pub fn episode_csv_path(
    root: &Path,
    experiment_id: &str,
    scene_id: &str,
    participant: &ParticipantId,
    episode: u32,
) -> PathBuf {
    root.join(experiment_id)
        .join(scene_id)
        .join(format!("{}_ep{}.csv", participant.as_str(), episode))
}

/// Builds the canonical file path of a participant's globals JSON.
#[must_use]
pub fn globals_path(
    root: &Path,
    experiment_id: &str,
    scene_id: &str,
    participant: &ParticipantId,
) -> PathBuf {
    root.join(experiment_id)
        .join(scene_id)
        .join(format!("{}_globals.json", participant.as_str()))
}

/// Renders the per-frame CSV for an episode.
///
/// Per-participant columns are emitted for every index in `data.indices`,
/// in order, so both peers produce the same header and the same cells for
/// all parity columns.
#[must_use]
pub fn episode_csv(data: &EpisodeData) -> String {
    let mut out = String::new();
    write_header(&mut out, &data.indices);
    for record in &data.records {
        write_row(&mut out, data.episode, &data.indices, record);
    }
    out
}

fn write_header(out: &mut String, indices: &[ParticipantIndex]) {
    out.push_str("t,episode_num");
    for index in indices {
        let _ = write!(out, ",actions.{index}");
    }
    for index in indices {
        let _ = write!(out, ",rewards.{index}");
    }
    for index in indices {
        let _ = write!(out, ",terminateds.{index}");
    }
    out.push_str(",terminateds.__all__");
    for index in indices {
        let _ = write!(out, ",truncateds.{index}");
    }
    out.push_str(",wasSpeculative,rollbackEvents\n");
}

fn write_row(out: &mut String, episode: u32, indices: &[ParticipantIndex], record: &StepRecord) {
    let _ = write!(out, "{},{}", record.frame, episode);
    for index in indices {
        match record.actions.get(index) {
            Some(action) => {
                let _ = write!(out, ",{action}");
            },
            None => out.push(','),
        }
    }
    for index in indices {
        match record.rewards.get(index) {
            Some(reward) => {
                let _ = write!(out, ",{reward}");
            },
            None => out.push(','),
        }
    }
    let mut all_terminated = !record.terminateds.is_empty();
    for index in indices {
        let flag = record.terminateds.get(index).copied().unwrap_or(false);
        all_terminated &= flag;
        let _ = write!(out, ",{flag}");
    }
    let _ = write!(out, ",{all_terminated}");
    for index in indices {
        let flag = record.truncateds.get(index).copied().unwrap_or(false);
        let _ = write!(out, ",{flag}");
    }
    let _ = write!(out, ",{}", record.was_speculative);
    out.push(',');
    push_csv_cell(out, &rollback_events_cell(record));
    out.push('\n');
}

fn rollback_events_cell(record: &StepRecord) -> String {
    if record.rollback_events.is_empty() {
        return "[]".to_owned();
    }
    serde_json::to_string(&record.rollback_events).unwrap_or_else(|_| "[]".to_owned())
}

/// Quotes a cell when it contains CSV-significant characters.
fn push_csv_cell(out: &mut String, cell: &str) {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') {
        out.push('"');
        for ch in cell.chars() {
            if ch == '"' {
                out.push('"');
            }
            out.push(ch);
        }
        out.push('"');
    } else {
        out.push_str(cell);
    }
}

/// Renders the globals JSON document. serde_json orders object keys, so the
/// output is deterministic.
pub fn globals_json(data: &EpisodeData) -> Result<String, ExportError> {
    let value = serde_json::json!({
        "session_id": data.session,
        "participant_id": data.participant,
        "participant_index": data.participant_index,
        "seed": data.seed,
        "episode": data.episode,
        "termination_reason": data.termination,
        "partial": data.partial,
        "counters": data.counters,
        "rtt": data.rtt,
        "desync_count": data.desyncs.len(),
    });
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Writes both files of an episode export under `root`.
pub fn write_to_dir(
    root: &Path,
    experiment_id: &str,
    scene_id: &str,
    data: &EpisodeData,
) -> Result<(), ExportError> {
    let csv_path = episode_csv_path(root, experiment_id, scene_id, &data.participant, data.episode);
    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&csv_path, episode_csv(data))?;
    std::fs::write(
        globals_path(root, experiment_id, scene_id, &data.participant),
        globals_json(data)?,
    )?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::recorder::RollbackEventRecord;
    use crate::{Action, Frame};

    fn sample_data() -> EpisodeData {
        let p0 = ParticipantIndex::new(0);
        let p1 = ParticipantIndex::new(1);
        let records = (0..3)
            .map(|frame| StepRecord {
                frame: Frame::new(frame),
                actions: BTreeMap::from([(p0, Action(frame % 3)), (p1, Action(frame % 3))]),
                rewards: BTreeMap::from([(p0, 0.5), (p1, -0.25)]),
                terminateds: BTreeMap::from([(p0, frame == 2), (p1, frame == 2)]),
                truncateds: BTreeMap::from([(p0, false), (p1, false)]),
                info: serde_json::Value::Null,
                was_speculative: frame == 1,
                rollback_events: if frame == 1 {
                    vec![RollbackEventRecord {
                        detected_at: Frame::new(2),
                        target: Frame::new(1),
                        depth: 1,
                    }]
                } else {
                    Vec::new()
                },
            })
            .collect();
        EpisodeData {
            session: SessionId::new("s1"),
            participant: ParticipantId::new("alice"),
            participant_index: p0,
            episode: 0,
            seed: 12345,
            indices: vec![p0, p1],
            records,
            counters: Counters::default(),
            rtt: BTreeMap::new(),
            desyncs: Vec::new(),
            termination: TerminationReason::GameComplete,
            partial: false,
        }
    }

    #[test]
    fn header_lists_all_required_columns() {
        let csv = episode_csv(&sample_data());
        let header = csv.lines().next().unwrap();
        assert_eq!(
            header,
            "t,episode_num,actions.0,actions.1,rewards.0,rewards.1,\
             terminateds.0,terminateds.1,terminateds.__all__,\
             truncateds.0,truncateds.1,wasSpeculative,rollbackEvents"
        );
    }

    #[test]
    fn rows_carry_frame_and_flags() {
        let csv = episode_csv(&sample_data());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("0,0,0,0,0.5,-0.25,false,false,false"));
        assert!(lines[3].contains("true,true,true"));
        // The speculative row carries a quoted rollback-events cell.
        assert!(lines[2].contains("true,\"[{"));
    }

    #[test]
    fn parity_columns_ignore_local_only_fields() {
        let mut ours = sample_data();
        let mut theirs = sample_data();
        theirs.participant = ParticipantId::new("bob");
        theirs.participant_index = ParticipantIndex::new(1);
        // Strip the local-only columns before comparing.
        for data in [&mut ours, &mut theirs] {
            for record in &mut data.records {
                record.was_speculative = false;
                record.rollback_events.clear();
            }
        }
        assert_eq!(episode_csv(&ours), episode_csv(&theirs));
    }

    #[test]
    fn paths_follow_the_layout() {
        let root = Path::new("data");
        let participant = ParticipantId::new("alice");
        assert_eq!(
            episode_csv_path(root, "exp1", "sceneA", &participant, 2),
            PathBuf::from("data/exp1/sceneA/alice_ep2.csv")
        );
        assert_eq!(
            globals_path(root, "exp1", "sceneA", &participant),
            PathBuf::from("data/exp1/sceneA/alice_globals.json")
        );
    }

    #[test]
    fn globals_json_is_deterministic() {
        let data = sample_data();
        assert_eq!(
            globals_json(&data).unwrap(),
            globals_json(&data).unwrap()
        );
        assert!(globals_json(&data).unwrap().contains("\"seed\": 12345"));
    }
}
