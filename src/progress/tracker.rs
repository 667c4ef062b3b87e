use super::{
    ProgressError, ProgressEvent, ProgressSample, ProgressSnapshot, ProgressUpdate, StageProgress,
    StageStatus, TrackingStatus,
};
use crate::config::StageSpec;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;

const EVENT_CAPACITY: usize = 256;

struct Entry {
    status: TrackingStatus,
    stages: Vec<StageProgress>,
    current: usize,
    overall: f64,
    message: Option<String>,
    window: VecDeque<(Instant, f64)>,
    samples: Vec<ProgressSample>,
    eta: Option<Duration>,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl Entry {
    fn new(specs: &[StageSpec], now: Instant) -> Self {
        let specs = if specs.is_empty() {
            vec![StageSpec::new("work", 1.0)]
        } else {
            specs.to_vec()
        };
        let mut stages: Vec<StageProgress> = specs
            .into_iter()
            .map(|spec| StageProgress {
                name: spec.name,
                weight: spec.weight.max(0.0),
                status: StageStatus::Pending,
                progress: 0.0,
                started_at: None,
                ended_at: None,
            })
            .collect();
        start_stage(&mut stages[0]);

        let mut window = VecDeque::new();
        window.push_back((now, 0.0));

        Self {
            status: TrackingStatus::Running,
            stages,
            current: 0,
            overall: 0.0,
            message: None,
            window,
            samples: vec![ProgressSample {
                timestamp: Utc::now(),
                overall: 0.0,
            }],
            eta: None,
            result: None,
            error: None,
        }
    }

    /// Weighted completion across stages; zero total weight counts stages equally
    fn weighted(&self) -> f64 {
        let total: f64 = self.stages.iter().map(|s| s.weight).sum();
        let equal = total <= f64::EPSILON;
        let total = if equal { self.stages.len() as f64 } else { total };

        let done: f64 = self
            .stages
            .iter()
            .map(|s| {
                let weight = if equal { 1.0 } else { s.weight };
                match s.status {
                    status if status.is_done() => weight,
                    StageStatus::Running | StageStatus::Failed => weight * s.progress / 100.0,
                    _ => 0.0,
                }
            })
            .sum();

        (done / total * 100.0).clamp(0.0, 100.0)
    }

    fn advance(&mut self) {
        finish_stage(&mut self.stages[self.current], StageStatus::Completed);
        if self.current + 1 < self.stages.len() {
            self.current += 1;
            start_stage(&mut self.stages[self.current]);
        }
    }

    fn record_sample(&mut self, now: Instant, window_size: usize) {
        self.overall = self.overall.max(self.weighted());
        self.window.push_back((now, self.overall));
        while self.window.len() > window_size.max(2) {
            self.window.pop_front();
        }
        self.samples.push(ProgressSample {
            timestamp: Utc::now(),
            overall: self.overall,
        });
        if self.samples.len() > window_size.max(2) * 10 {
            self.samples.remove(0);
        }
        self.eta = estimate_remaining(&self.window, self.overall);
    }

    fn snapshot(&self, subject_id: &str) -> ProgressSnapshot {
        ProgressSnapshot {
            subject_id: subject_id.to_string(),
            status: self.status,
            stages: self.stages.clone(),
            current_stage: self.current,
            overall: self.overall,
            message: self.message.clone(),
            eta: self.eta,
            estimated_completion: self
                .eta
                .and_then(|eta| chrono::Duration::from_std(eta).ok())
                .map(|eta| Utc::now() + eta),
            samples: self.samples.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }

    fn ensure_running(&self, subject_id: &str) -> Result<(), ProgressError> {
        if self.status == TrackingStatus::Running {
            Ok(())
        } else {
            Err(ProgressError::NotRunning {
                subject_id: subject_id.to_string(),
                status: self.status,
            })
        }
    }
}

fn start_stage(stage: &mut StageProgress) {
    if stage.status == StageStatus::Pending {
        stage.status = StageStatus::Running;
        stage.started_at = Some(Utc::now());
    }
}

fn finish_stage(stage: &mut StageProgress, status: StageStatus) {
    if stage.started_at.is_none() {
        stage.started_at = Some(Utc::now());
    }
    stage.status = status;
    stage.progress = 100.0;
    stage.ended_at = Some(Utc::now());
}

/// Remaining time from the rate between the first and last sample in the window
fn estimate_remaining(window: &VecDeque<(Instant, f64)>, overall: f64) -> Option<Duration> {
    if window.len() < 2 {
        return None;
    }
    let (first_at, first) = window.front()?;
    let (last_at, last) = window.back()?;
    let elapsed = last_at.duration_since(*first_at).as_secs_f64();
    if elapsed <= 0.0 {
        return None;
    }

    let rate = (last - first) / elapsed;
    if rate <= 0.0 || !rate.is_finite() {
        return None;
    }

    Duration::try_from_secs_f64((100.0 - overall).max(0.0) / rate).ok()
}

/// Tracks progress for tasks and workflows by subject id
pub struct ProgressTracker {
    entries: RwLock<HashMap<String, Entry>>,
    window_size: usize,
    events: broadcast::Sender<ProgressEvent>,
}

impl ProgressTracker {
    pub fn new(window_size: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            window_size: window_size.max(2),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Begin tracking a subject, replacing any previous entry
    pub async fn start_tracking(&self, subject_id: &str, stages: &[StageSpec]) {
        self.start_tracking_at(subject_id, stages, Instant::now()).await
    }

    pub async fn start_tracking_at(&self, subject_id: &str, stages: &[StageSpec], now: Instant) {
        let entry = Entry::new(stages, now);
        let names = entry.stages.iter().map(|s| s.name.clone()).collect();
        self.entries
            .write()
            .await
            .insert(subject_id.to_string(), entry);
        self.emit(ProgressEvent::Started {
            subject_id: subject_id.to_string(),
            stages: names,
        });
    }

    pub async fn update(
        &self,
        subject_id: &str,
        update: ProgressUpdate,
    ) -> Result<ProgressSnapshot, ProgressError> {
        self.update_at(subject_id, update, Instant::now()).await
    }

    /// Apply an update observed at `now`
    pub async fn update_at(
        &self,
        subject_id: &str,
        update: ProgressUpdate,
        now: Instant,
    ) -> Result<ProgressSnapshot, ProgressError> {
        let snapshot = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(subject_id)
                .ok_or_else(|| ProgressError::NotFound(subject_id.to_string()))?;
            entry.ensure_running(subject_id)?;

            if let Some(name) = &update.stage {
                match entry.stages.iter().position(|s| &s.name == name) {
                    Some(target) if target > entry.current => {
                        while entry.current < target {
                            entry.advance();
                        }
                    }
                    Some(_) => {}
                    None => {
                        return Err(ProgressError::UnknownStage {
                            subject_id: subject_id.to_string(),
                            stage: name.clone(),
                        });
                    }
                }
            }

            if update.advance_stage {
                entry.advance();
            }

            if let Some(progress) = update.stage_progress {
                let stage = &mut entry.stages[entry.current];
                if stage.status == StageStatus::Running {
                    stage.progress = stage.progress.max(progress.clamp(0.0, 100.0));
                }
            }

            if update.message.is_some() {
                entry.message = update.message;
            }

            entry.record_sample(now, self.window_size);
            entry.snapshot(subject_id)
        };

        self.emit(ProgressEvent::Updated {
            subject_id: subject_id.to_string(),
            overall: snapshot.overall,
            stage: snapshot.current_stage_name().map(String::from),
            message: snapshot.message.clone(),
        });
        Ok(snapshot)
    }

    /// Set one named stage directly (stages that run concurrently, like workflow steps)
    pub async fn mark_stage(
        &self,
        subject_id: &str,
        stage: &str,
        status: StageStatus,
        progress: Option<f64>,
    ) -> Result<ProgressSnapshot, ProgressError> {
        let now = Instant::now();
        let snapshot = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(subject_id)
                .ok_or_else(|| ProgressError::NotFound(subject_id.to_string()))?;
            entry.ensure_running(subject_id)?;

            let index = entry
                .stages
                .iter()
                .position(|s| s.name == stage)
                .ok_or_else(|| ProgressError::UnknownStage {
                    subject_id: subject_id.to_string(),
                    stage: stage.to_string(),
                })?;

            let target = &mut entry.stages[index];
            match status {
                StageStatus::Completed | StageStatus::Skipped => finish_stage(target, status),
                StageStatus::Running => {
                    start_stage(target);
                    if let Some(progress) = progress {
                        target.progress = target.progress.max(progress.clamp(0.0, 100.0));
                    }
                }
                StageStatus::Pending | StageStatus::Failed => {
                    target.status = status;
                }
            }
            entry.current = entry
                .stages
                .iter()
                .position(|s| !s.status.is_done())
                .unwrap_or(entry.stages.len() - 1);

            entry.record_sample(now, self.window_size);
            entry.snapshot(subject_id)
        };

        self.emit(ProgressEvent::Updated {
            subject_id: subject_id.to_string(),
            overall: snapshot.overall,
            stage: Some(stage.to_string()),
            message: snapshot.message.clone(),
        });
        Ok(snapshot)
    }

    /// Finish the subject: every stage is forced to 100%
    pub async fn complete(
        &self,
        subject_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<ProgressSnapshot, ProgressError> {
        let snapshot = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(subject_id)
                .ok_or_else(|| ProgressError::NotFound(subject_id.to_string()))?;
            entry.ensure_running(subject_id)?;

            for stage in entry.stages.iter_mut() {
                if !stage.status.is_done() {
                    finish_stage(stage, StageStatus::Completed);
                }
            }
            entry.current = entry.stages.len() - 1;
            entry.overall = 100.0;
            entry.status = TrackingStatus::Completed;
            entry.result = result;
            entry.eta = None;
            entry.samples.push(ProgressSample {
                timestamp: Utc::now(),
                overall: 100.0,
            });
            entry.snapshot(subject_id)
        };

        self.emit(ProgressEvent::Completed {
            subject_id: subject_id.to_string(),
        });
        Ok(snapshot)
    }

    /// Stop the subject, freezing its progress where it stands
    pub async fn fail(
        &self,
        subject_id: &str,
        error: impl Into<String>,
    ) -> Result<ProgressSnapshot, ProgressError> {
        let error = error.into();
        let snapshot = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(subject_id)
                .ok_or_else(|| ProgressError::NotFound(subject_id.to_string()))?;
            entry.ensure_running(subject_id)?;

            let current = entry.current;
            if entry.stages[current].status == StageStatus::Running {
                entry.stages[current].status = StageStatus::Failed;
                entry.stages[current].ended_at = Some(Utc::now());
            }
            entry.status = TrackingStatus::Failed;
            entry.error = Some(error.clone());
            entry.eta = None;
            entry.snapshot(subject_id)
        };

        self.emit(ProgressEvent::Failed {
            subject_id: subject_id.to_string(),
            overall: snapshot.overall,
            error,
        });
        Ok(snapshot)
    }

    pub async fn get(&self, subject_id: &str) -> Option<ProgressSnapshot> {
        self.entries
            .read()
            .await
            .get(subject_id)
            .map(|e| e.snapshot(subject_id))
    }

    pub async fn remove(&self, subject_id: &str) -> bool {
        self.entries.write().await.remove(subject_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn stages() -> Vec<StageSpec> {
        vec![
            StageSpec::new("analyze", 1.0),
            StageSpec::new("implement", 3.0),
            StageSpec::new("verify", 1.0),
        ]
    }

    #[tokio::test]
    async fn test_weighted_overall() {
        let tracker = ProgressTracker::new(10);
        tracker.start_tracking("t1", &stages()).await;

        let snap = tracker
            .update("t1", ProgressUpdate::percent(50.0))
            .await
            .unwrap();
        // analyze half done: 0.5 / 5
        assert!((snap.overall - 10.0).abs() < 1e-9);

        let snap = tracker.update("t1", ProgressUpdate::advance()).await.unwrap();
        assert!((snap.overall - 20.0).abs() < 1e-9);
        assert_eq!(snap.current_stage_name(), Some("implement"));

        let snap = tracker
            .update("t1", ProgressUpdate::percent(50.0))
            .await
            .unwrap();
        // analyze 1 + implement 1.5 out of 5
        assert!((snap.overall - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stage_jump_completes_earlier_stages() {
        let tracker = ProgressTracker::new(10);
        tracker.start_tracking("t1", &stages()).await;

        let snap = tracker
            .update("t1", ProgressUpdate::enter_stage("verify"))
            .await
            .unwrap();
        assert_eq!(snap.current_stage, 2);
        assert_eq!(snap.stages[0].status, StageStatus::Completed);
        assert_eq!(snap.stages[1].status, StageStatus::Completed);
        assert!((snap.overall - 80.0).abs() < 1e-9);

        let err = tracker
            .update("t1", ProgressUpdate::enter_stage("deploy"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressError::UnknownStage { .. }));
    }

    #[tokio::test]
    async fn test_progress_never_decreases_while_running() {
        let tracker = ProgressTracker::new(5);
        tracker.start_tracking("t1", &stages()).await;
        let mut rng = rand::rng();
        let mut last = 0.0;

        for _ in 0..200 {
            let update = if rng.random_bool(0.1) {
                ProgressUpdate::advance()
            } else {
                ProgressUpdate::percent(rng.random_range(0.0..100.0))
            };
            let snap = tracker.update("t1", update).await.unwrap();
            assert!(snap.overall >= last, "{} < {}", snap.overall, last);
            last = snap.overall;
        }
    }

    #[tokio::test]
    async fn test_complete_forces_100() {
        let tracker = ProgressTracker::new(10);
        tracker.start_tracking("t1", &stages()).await;
        tracker
            .update("t1", ProgressUpdate::percent(30.0))
            .await
            .unwrap();

        let snap = tracker
            .complete("t1", Some(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(snap.overall, 100.0);
        assert_eq!(snap.status, TrackingStatus::Completed);
        assert!(snap.stages.iter().all(|s| s.progress == 100.0));
        assert!(snap.eta.is_none());

        let err = tracker
            .update("t1", ProgressUpdate::percent(10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_fail_freezes_values() {
        let tracker = ProgressTracker::new(10);
        tracker.start_tracking("t1", &stages()).await;
        tracker.update("t1", ProgressUpdate::advance()).await.unwrap();
        tracker
            .update("t1", ProgressUpdate::percent(40.0))
            .await
            .unwrap();

        let snap = tracker.fail("t1", "timeout").await.unwrap();
        assert_eq!(snap.status, TrackingStatus::Failed);
        assert_eq!(snap.stages[1].status, StageStatus::Failed);
        assert_eq!(snap.stages[1].progress, 40.0);
        assert_eq!(snap.error.as_deref(), Some("timeout"));

        let later = tracker.get("t1").await.unwrap();
        assert_eq!(later.overall, snap.overall);
        assert_eq!(later.samples.len(), snap.samples.len());
    }

    #[tokio::test]
    async fn test_eta_requires_two_samples_and_positive_rate() {
        let tracker = ProgressTracker::new(10);
        let start = Instant::now();
        tracker.start_tracking_at("t1", &[], start).await;

        // Only the starting sample
        assert!(tracker.get("t1").await.unwrap().eta.is_none());

        // Second sample with no progress: rate is zero
        let snap = tracker
            .update_at("t1", ProgressUpdate::default(), start + Duration::from_secs(1))
            .await
            .unwrap();
        assert!(snap.eta.is_none());

        // 25% over 2 seconds: 75% left at 12.5%/s is 6 seconds
        let snap = tracker
            .update_at("t1", ProgressUpdate::percent(25.0), start + Duration::from_secs(2))
            .await
            .unwrap();
        let eta = snap.eta.unwrap();
        assert!((eta.as_secs_f64() - 6.0).abs() < 1e-6);
        assert!(snap.estimated_completion.is_some());
    }

    #[tokio::test]
    async fn test_eta_window_is_bounded() {
        let tracker = ProgressTracker::new(2);
        let start = Instant::now();
        tracker.start_tracking_at("t1", &[], start).await;
        tracker
            .update_at("t1", ProgressUpdate::percent(50.0), start + Duration::from_secs(1))
            .await
            .unwrap();
        // Stalled after the jump; the window only sees the flat tail
        let snap = tracker
            .update_at("t1", ProgressUpdate::percent(50.0), start + Duration::from_secs(100))
            .await
            .unwrap();
        assert!(snap.eta.is_none());
    }

    #[tokio::test]
    async fn test_mark_stage_for_parallel_steps() {
        let tracker = ProgressTracker::new(10);
        let steps = vec![
            StageSpec::new("a", 1.0),
            StageSpec::new("b", 1.0),
            StageSpec::new("c", 2.0),
        ];
        tracker.start_tracking("wf", &steps).await;

        tracker
            .mark_stage("wf", "b", StageStatus::Completed, None)
            .await
            .unwrap();
        let snap = tracker
            .mark_stage("wf", "c", StageStatus::Skipped, None)
            .await
            .unwrap();
        assert!((snap.overall - 75.0).abs() < 1e-9);
        assert_eq!(snap.current_stage_name(), Some("a"));
    }

    #[tokio::test]
    async fn test_unknown_subject() {
        let tracker = ProgressTracker::new(10);
        assert!(tracker.get("missing").await.is_none());
        assert!(matches!(
            tracker.update("missing", ProgressUpdate::advance()).await,
            Err(ProgressError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_events_published() {
        let tracker = ProgressTracker::new(10);
        let mut events = tracker.subscribe();
        tracker.start_tracking("t1", &stages()).await;
        tracker.complete("t1", None).await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            ProgressEvent::Started { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ProgressEvent::Completed { .. }
        ));
    }
}
