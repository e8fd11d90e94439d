//! Target resolution selection for a batch.
//!
//! Every asset votes for the canonical geometry of its bucket; the most
//! common bucket wins so the fewest assets need letterboxing.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use rmerge_models::{GeometryBucket, TargetResolution};

use crate::probe::MediaProbe;

/// Outcome of probing and voting over a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionReport {
    pub target: TargetResolution,
    /// Bucket tallies in first-seen order
    pub votes: Vec<(GeometryBucket, usize)>,
    /// Assets that could not be probed and did not vote
    pub unprobed: Vec<PathBuf>,
}

/// Tally buckets for display dimensions.
///
/// Ties go to the bucket seen first. Returns `None` when nothing voted.
pub fn vote<I>(dimensions: I) -> (Option<TargetResolution>, Vec<(GeometryBucket, usize)>)
where
    I: IntoIterator<Item = (u32, u32)>,
{
    let mut votes: Vec<(GeometryBucket, usize)> = Vec::new();
    for (width, height) in dimensions {
        let bucket = GeometryBucket::classify(width, height);
        match votes.iter_mut().find(|(b, _)| *b == bucket) {
            Some((_, count)) => *count += 1,
            None => votes.push((bucket, 1)),
        }
    }

    // Strictly greater keeps the earliest bucket on ties.
    let mut winner: Option<(GeometryBucket, usize)> = None;
    for &(bucket, count) in &votes {
        if winner.map_or(true, |(_, best)| count > best) {
            winner = Some((bucket, count));
        }
    }

    (winner.map(|(bucket, _)| bucket.canonical()), votes)
}

/// Probe every asset and vote on the batch target.
pub async fn analyze(probe: &dyn MediaProbe, paths: &[PathBuf]) -> ResolutionReport {
    let mut dimensions = Vec::with_capacity(paths.len());
    let mut unprobed = Vec::new();

    for path in paths {
        match probe.probe(path).await {
            Ok(info) => dimensions.push(info.display_dimensions()),
            Err(e) => {
                warn!("Excluding {} from resolution vote: {}", path.display(), e);
                unprobed.push(path.clone());
            }
        }
    }

    let (target, votes) = vote(dimensions);
    let target = target.unwrap_or_else(TargetResolution::default_portrait);
    debug!(target = %target, votes = ?votes, "Selected batch target");

    ResolutionReport {
        target,
        votes,
        unprobed,
    }
}

/// Select one target geometry for a batch.
pub async fn select_target(probe: &dyn MediaProbe, paths: &[impl AsRef<Path>]) -> TargetResolution {
    let owned: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
    analyze(probe, &owned).await.target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MediaError, MediaResult};
    use crate::probe::VideoInfo;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeProbe(HashMap<PathBuf, (u32, u32)>);

    #[async_trait]
    impl MediaProbe for FakeProbe {
        async fn probe(&self, path: &Path) -> MediaResult<VideoInfo> {
            let (width, height) = self
                .0
                .get(path)
                .copied()
                .ok_or_else(|| MediaError::FileNotFound(path.to_path_buf()))?;
            Ok(VideoInfo {
                duration: 1.0,
                width,
                height,
                rotation: 0,
                fps: 30.0,
                codec: "h264".into(),
                has_audio: true,
            })
        }
    }

    #[test]
    fn test_dominant_bucket_wins() {
        let (target, votes) = vote([(1280, 720), (1080, 1920), (1440, 2560), (720, 1280)]);
        assert_eq!(target, Some(TargetResolution::new(1080, 1920)));
        assert_eq!(votes[0], (GeometryBucket::LandscapeSmall, 1));
    }

    #[test]
    fn test_tie_goes_to_first_seen() {
        let (target, _) = vote([(1920, 1080), (720, 1280), (1920, 1080), (720, 1280)]);
        assert_eq!(target, Some(TargetResolution::new(1920, 1080)));
    }

    #[test]
    fn test_no_votes() {
        let (target, votes) = vote(std::iter::empty());
        assert!(target.is_none());
        assert!(votes.is_empty());
    }

    #[tokio::test]
    async fn test_analyze_skips_unprobeable() {
        let probe = FakeProbe(HashMap::from([
            (PathBuf::from("/a.mp4"), (1280, 720)),
            (PathBuf::from("/b.mp4"), (1920, 1080)),
        ]));
        let paths = vec![
            PathBuf::from("/a.mp4"),
            PathBuf::from("/missing.mp4"),
            PathBuf::from("/b.mp4"),
        ];
        let report = analyze(&probe, &paths).await;
        assert_eq!(report.target, TargetResolution::new(1280, 720));
        assert_eq!(report.unprobed, vec![PathBuf::from("/missing.mp4")]);
    }

    #[tokio::test]
    async fn test_default_when_nothing_probes() {
        let probe = FakeProbe(HashMap::new());
        let target = select_target(&probe, &[PathBuf::from("/x.mp4")]).await;
        assert_eq!(target, TargetResolution::default_portrait());
    }
}
