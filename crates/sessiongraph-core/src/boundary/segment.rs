//! Segmentation of a session into analysis units

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionEntry;

use super::detector::{detect_boundaries, Boundary};

/// A contiguous span of a session's non-metadata entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start_entry_id: String,
    pub end_entry_id: String,
    /// Number of non-metadata entries in the span
    pub entry_count: usize,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    /// Boundaries that opened this segment (empty for the first one)
    pub boundaries: Vec<Boundary>,
}

impl Segment {
    pub fn duration_minutes(&self) -> f64 {
        (self.end_timestamp - self.start_timestamp).num_milliseconds() as f64 / 60_000.0
    }
}

/// Split a session into segments, cutting at every boundary entry
///
/// Segments partition the non-metadata entries in order. A session without
/// boundaries is one segment; a session without non-metadata entries has none.
pub fn extract_segments(entries: &[SessionEntry]) -> Vec<Segment> {
    let boundaries = detect_boundaries(entries);
    segments_from_boundaries(entries, boundaries)
}

/// Cut segments using boundaries that were already detected
pub fn segments_from_boundaries(entries: &[SessionEntry], boundaries: Vec<Boundary>) -> Vec<Segment> {
    let mut opened_by: HashMap<String, Vec<Boundary>> = HashMap::new();
    for boundary in boundaries {
        opened_by
            .entry(boundary.entry_id.clone())
            .or_default()
            .push(boundary);
    }

    let mut segments = Vec::new();
    let mut current: Option<Segment> = None;

    for entry in entries.iter().filter(|e| !e.is_metadata()) {
        let cut = opened_by.remove(&entry.id);

        match current.as_mut() {
            Some(segment) if cut.is_none() => {
                segment.end_entry_id = entry.id.clone();
                segment.end_timestamp = entry.timestamp;
                segment.entry_count += 1;
            }
            _ => {
                if let Some(done) = current.take() {
                    segments.push(done);
                }
                current = Some(Segment {
                    start_entry_id: entry.id.clone(),
                    end_entry_id: entry.id.clone(),
                    entry_count: 1,
                    start_timestamp: entry.timestamp,
                    end_timestamp: entry.timestamp,
                    boundaries: cut.unwrap_or_default(),
                });
            }
        }
    }

    segments.extend(current);
    segments
}

/// Raw entries covered by a segment, including interleaved metadata entries
///
/// Returns an empty slice when the segment does not belong to `entries`.
pub fn segment_entries<'a>(entries: &'a [SessionEntry], segment: &Segment) -> &'a [SessionEntry] {
    let Some(start) = entries.iter().position(|e| e.id == segment.start_entry_id) else {
        return &[];
    };
    let Some(len) = entries[start..]
        .iter()
        .position(|e| e.id == segment.end_entry_id)
    else {
        return &[];
    };
    &entries[start..=start + len]
}

#[cfg(test)]
mod tests {
    use super::super::detector::test_support::*;
    use super::super::detector::BoundaryType;
    use super::*;
    use chrono::Duration;

    fn ids(entries: &[SessionEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_zero_boundaries_single_segment() {
        let entries = linear(5);
        let segments = extract_segments(&entries);

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_entry_id, "e0");
        assert_eq!(segments[0].end_entry_id, "e4");
        assert_eq!(segments[0].entry_count, 5);
        assert!(segments[0].boundaries.is_empty());
    }

    #[test]
    fn test_empty_and_metadata_only_sessions() {
        assert!(extract_segments(&[]).is_empty());
        let t = base_time();
        assert!(extract_segments(&[label("l", "x", t)]).is_empty());
    }

    #[test]
    fn test_cut_at_each_boundary() {
        let t = base_time();
        let entries = vec![
            message("a", None, t),
            message("b", Some("a"), t + Duration::minutes(1)),
            message("c", Some("b"), t + Duration::minutes(20)),
            compaction("d", Some("c"), t + Duration::minutes(21)),
            message("e", Some("d"), t + Duration::minutes(22)),
        ];
        let segments = extract_segments(&entries);

        let spans: Vec<_> = segments
            .iter()
            .map(|s| (s.start_entry_id.as_str(), s.end_entry_id.as_str(), s.entry_count))
            .collect();
        assert_eq!(spans, vec![("a", "b", 2), ("c", "c", 1), ("d", "e", 2)]);
        assert_eq!(segments[1].boundaries[0].boundary_type, BoundaryType::Resume);
        assert_eq!(segments[2].boundaries[0].boundary_type, BoundaryType::Compaction);
    }

    #[test]
    fn test_segments_partition_non_metadata_entries() {
        let t = base_time();
        let entries = vec![
            compaction("c0", None, t),
            message("a", Some("c0"), t + Duration::minutes(1)),
            label("l1", "a", t + Duration::minutes(2)),
            message("b", Some("a"), t + Duration::minutes(15)),
            message("c", Some("a"), t + Duration::minutes(16)),
            branch_summary("s", Some("a"), "c", t + Duration::minutes(17)),
            message("d", Some("a"), t + Duration::minutes(18)),
            message("e", Some("missing"), t + Duration::minutes(19)),
        ];
        let segments = extract_segments(&entries);

        let covered: Vec<String> = segments
            .iter()
            .flat_map(|s| {
                segment_entries(&entries, s)
                    .iter()
                    .filter(|e| !e.is_metadata())
                    .map(|e| e.id.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        let expected: Vec<String> = entries
            .iter()
            .filter(|e| !e.is_metadata())
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(covered, expected);

        let total: usize = segments.iter().map(|s| s.entry_count).sum();
        assert_eq!(total, expected.len());

        // the compaction opening the session does not produce an empty segment
        assert_eq!(segments[0].start_entry_id, "c0");
        assert_eq!(segments[0].boundaries.len(), 1);
    }

    #[test]
    fn test_segmentation_is_idempotent() {
        let t = base_time();
        let entries = vec![
            message("a", None, t),
            message("b", Some("a"), t + Duration::minutes(11)),
            message("c", Some("a"), t + Duration::minutes(12)),
        ];
        assert_eq!(extract_segments(&entries), extract_segments(&entries));
    }

    #[test]
    fn test_segment_entries_include_metadata() {
        let t = base_time();
        let entries = vec![
            message("a", None, t),
            label("l", "a", t + Duration::seconds(1)),
            message("b", Some("a"), t + Duration::seconds(2)),
        ];
        let segments = extract_segments(&entries);
        assert_eq!(ids(segment_entries(&entries, &segments[0])), vec!["a", "l", "b"]);
    }

    #[test]
    fn test_segment_entries_unknown_segment() {
        let entries = linear(3);
        let mut segment = extract_segments(&entries).remove(0);
        segment.start_entry_id = "nope".into();
        assert!(segment_entries(&entries, &segment).is_empty());
    }
}
