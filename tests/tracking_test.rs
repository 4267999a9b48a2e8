use std::collections::HashSet;

use proptest::prelude::*;
use streamtrack::tracker::{TrackEvent, TrackerOutput};
use streamtrack::{
    BackendKind, Detection, DetectionBuilder, ObjectTracker, Rect, Timestamp, TrackId, TrackState, TrackerConfig,
};

fn det(x: f32, y: f32, confidence: f32) -> Detection {
    Detection::new(Rect::new(x, y, 100.0, 100.0), 0, confidence, BackendKind::Cpu)
}

#[test]
fn test_basic_tracking() {
    let mut tracker = ObjectTracker::new(TrackerConfig {
        confirm_hits: 2,
        miss_threshold: 1,
        ..TrackerConfig::default()
    });

    // Frame 1: one detection starts a tentative track
    let out = tracker.update(&[det(100.0, 100.0, 0.9)], Timestamp(0));
    assert!(matches!(out.events.as_slice(), [TrackEvent::Created(t)] if t.id == TrackId(1)));

    // Frame 2: same object shifted 2px confirms it
    let out = tracker.update(&[det(102.0, 100.0, 0.85)], Timestamp(40));
    assert!(matches!(
        out.events.as_slice(),
        [TrackEvent::Confirmed { track, recovered: false }] if track.id == TrackId(1)
    ));

    // Frame 3: nothing detected, one miss is enough
    let out = tracker.update(&[], Timestamp(80));
    assert!(matches!(out.events.as_slice(), [TrackEvent::Lost(t)] if t.id == TrackId(1)));
    assert_eq!(out.tracks[0].state, TrackState::Lost);
}

#[test]
fn test_occlusion_recovered_by_low_score_tier() {
    let mut tracker = ObjectTracker::new(TrackerConfig {
        confirm_hits: 1,
        miss_threshold: 2,
        ..TrackerConfig::default()
    });
    tracker.update(&[det(100.0, 100.0, 0.9)], Timestamp(0));
    tracker.update(&[det(105.0, 105.0, 0.9)], Timestamp(40));

    // Partially occluded: score drops below the high threshold
    let out = tracker.update(&[det(110.0, 110.0, 0.2)], Timestamp(80));
    assert_eq!(out.tracks.len(), 1);
    assert_eq!(out.tracks[0].id, TrackId(1));
    assert_eq!(out.tracks[0].state, TrackState::Confirmed);

    // Disappears, then reappears within the lost TTL
    tracker.update(&[], Timestamp(120));
    let out = tracker.update(&[], Timestamp(160));
    assert_eq!(out.tracks[0].state, TrackState::Lost);
    let out = tracker.update(&[det(125.0, 125.0, 0.9)], Timestamp(200));
    assert_eq!(out.tracks.len(), 1);
    assert_eq!(out.tracks[0].id, TrackId(1));
    assert!(matches!(out.events.as_slice(), [TrackEvent::Confirmed { recovered: true, .. }]));
}

#[test]
fn test_two_objects_keep_their_ids() {
    let mut tracker = ObjectTracker::new(TrackerConfig {
        confirm_hits: 1,
        ..TrackerConfig::default()
    });
    let person = |x: f32, conf: f32| {
        DetectionBuilder::new()
            .tlwh(x, 50.0, 40.0, 90.0)
            .class(0)
            .confidence(conf)
            .build()
    };
    tracker.update(&[person(0.0, 0.9), person(300.0, 0.8)], Timestamp(0));
    for step in 1..10u64 {
        let shift = step as f32 * 3.0;
        // listed in reverse order on purpose
        let out = tracker.update(&[person(300.0 - shift, 0.8), person(shift, 0.9)], Timestamp(step * 40));
        let ids: Vec<TrackId> = out.tracks.iter().map(|t| t.id).collect();
        assert_eq!(ids, [TrackId(1), TrackId(2)]);
        let left = tracker.get(TrackId(1)).unwrap();
        assert!(left.rect().x < 150.0);
    }
}

fn run(config: &TrackerConfig, frames: &[Vec<Detection>]) -> Vec<TrackerOutput> {
    let mut tracker = ObjectTracker::new(config.clone());
    frames
        .iter()
        .enumerate()
        .map(|(i, dets)| tracker.update(dets, Timestamp(i as u64 * 40)))
        .collect()
}

fn detections() -> impl Strategy<Value = Vec<Detection>> {
    // few positions on a coarse grid so tracks actually get re-associated
    prop::collection::vec((0u8..4, 0u8..3, -3.0f32..3.0, 0.05f32..1.0), 0..5).prop_map(|raw| {
        raw.into_iter()
            .map(|(gx, gy, jitter, conf)| {
                det(f32::from(gx) * 150.0 + jitter, f32::from(gy) * 150.0 - jitter, conf)
            })
            .collect()
    })
}

fn tracker_config() -> impl Strategy<Value = TrackerConfig> {
    (1u32..4, 1u32..5, 0u64..400).prop_map(|(confirm_hits, miss_threshold, lost_ttl_ms)| TrackerConfig {
        confirm_hits,
        miss_threshold,
        lost_ttl_ms,
        ..TrackerConfig::default()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a purged id never comes back and new ids only grow
    #[test]
    fn proptest_ids_never_reused(
        config in tracker_config(),
        frames in prop::collection::vec(detections(), 1..40),
    ) {
        let mut created: Vec<TrackId> = Vec::new();
        let mut purged: HashSet<TrackId> = HashSet::new();
        for out in run(&config, &frames) {
            for track in &out.tracks {
                prop_assert!(!purged.contains(&track.id), "purged track {} reappeared", track.id);
            }
            for event in &out.events {
                match event {
                    TrackEvent::Created(track) => {
                        prop_assert!(created.last().is_none_or(|last| *last < track.id));
                        created.push(track.id);
                    }
                    TrackEvent::Purged(id) => {
                        purged.insert(*id);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Property: replaying the same detections gives the same tracks
    #[test]
    fn proptest_deterministic_replay(
        config in tracker_config(),
        frames in prop::collection::vec(detections(), 1..30),
    ) {
        let first = run(&config, &frames);
        let second = run(&config, &frames);
        for (a, b) in first.iter().zip(&second) {
            prop_assert_eq!(&a.events, &b.events);
            prop_assert_eq!(&a.tracks, &b.tracks);
        }
    }

    /// Property: confirmed tracks become lost exactly at the miss threshold
    #[test]
    fn proptest_lost_iff_miss_threshold(
        config in tracker_config(),
        frames in prop::collection::vec(detections(), 1..40),
    ) {
        for out in run(&config, &frames) {
            for event in &out.events {
                if let TrackEvent::Lost(track) = event {
                    prop_assert_eq!(track.misses, config.miss_threshold);
                }
            }
            for track in out.tracks.iter().filter(|t| t.state == TrackState::Confirmed) {
                prop_assert!(track.misses < config.miss_threshold);
            }
        }
    }
}
