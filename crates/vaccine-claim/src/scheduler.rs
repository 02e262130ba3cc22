use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::claim_executor::ClaimSubmitter;
use crate::claim_types::*;
use crate::claim_walker::ClaimResolver;
use crate::place_client::AvailabilitySource;

/// Source of the local hour, replaceable in tests
pub trait Clock: Send + Sync {
    /// Hour of the day, `0..24`
    fn current_hour(&self) -> u32;
}

/// Wall clock in the local time zone
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current_hour(&self) -> u32 {
        Local::now().hour()
    }
}

/// Hours of the day during which the provider accepts claims
///
/// Covers `[start_hour, end_hour)`, wrapping past midnight when
/// `start_hour > end_hour`. Equal bounds mean always active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveWindow {
    start_hour: u32,
    end_hour: u32,
}

impl ActiveWindow {
    /// Build a window from two hours in `0..24`
    pub fn new(start_hour: u32, end_hour: u32) -> Result<Self, ClaimError> {
        if start_hour >= 24 || end_hour >= 24 {
            return Err(ClaimError::Config(format!(
                "active hours must be within 0-23, got {}-{}",
                start_hour, end_hour
            )));
        }
        Ok(Self {
            start_hour,
            end_hour,
        })
    }

    /// A window that never closes
    pub fn always() -> Self {
        Self {
            start_hour: 0,
            end_hour: 0,
        }
    }

    /// Whether polling is allowed at this hour
    pub fn contains(&self, hour: u32) -> bool {
        match self.start_hour.cmp(&self.end_hour) {
            std::cmp::Ordering::Equal => true,
            std::cmp::Ordering::Less => hour >= self.start_hour && hour < self.end_hour,
            std::cmp::Ordering::Greater => hour >= self.start_hour || hour < self.end_hour,
        }
    }
}

impl Default for ActiveWindow {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 18,
        }
    }
}

impl fmt::Display for ActiveWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.start_hour, self.end_hour)
    }
}

impl FromStr for ActiveWindow {
    type Err = ClaimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClaimError::Config(format!("active hours '{}' are not START-END", s));
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse::<u32>().map_err(|_| invalid())?;
        let end = end.trim().parse::<u32>().map_err(|_| invalid())?;
        ActiveWindow::new(start, end)
    }
}

/// Loop timing and failure limits
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// When polling is allowed (default: 09-18)
    pub active_window: ActiveWindow,

    /// Sleep while outside the active window (default: 10 minutes)
    pub idle_interval: Duration,

    /// Minimum cycle spacing per monitored region (default: 700 ms)
    pub per_region_interval: Duration,

    /// Consecutive cycles with every poll failing before giving up;
    /// zero disables the check (default: 30)
    pub max_failed_cycles: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            active_window: ActiveWindow::default(),
            idle_interval: Duration::from_secs(10 * 60),
            per_region_interval: Duration::from_millis(700),
            max_failed_cycles: 30,
        }
    }
}

/// What the loop is looking for
#[derive(Debug, Clone)]
pub struct ClaimTarget {
    /// Regions polled in order
    pub regions: Vec<Region>,
    /// Search filters
    pub criteria: SearchCriteria,
    /// Requested options, most preferred first
    pub option_ids: Vec<String>,
    /// How sessions are submitted
    pub mode: ClaimMode,
}

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Outside the active window
    Idle,
    /// Polling regions, nothing matched yet
    Polling,
    /// Walking or executing a candidate
    Resolving,
    /// A claim succeeded
    Done,
}

/// Outcome recorded for one candidate
#[derive(Debug, Clone)]
pub struct ClaimReport {
    /// Facility that was tried
    pub candidate: Candidate,
    /// What happened
    pub outcome: ClaimOutcome,
}

/// Result of one pass over the regions
#[derive(Debug)]
pub enum CycleResult {
    /// Outside the active window; nothing was polled
    Idle {
        /// Time to sleep before the next check
        wait: Duration,
    },
    /// Every region was polled without a successful claim
    Exhausted {
        /// Time spent polling
        elapsed: Duration,
        /// Time to sleep before the next cycle
        wait: Duration,
        /// Candidates tried this cycle
        reports: Vec<ClaimReport>,
    },
    /// A claim succeeded or was handed to the user
    Finished(ClaimReport),
}

/// Why the loop stopped
#[derive(Debug)]
pub enum RunOutcome {
    /// A claim succeeded or was handed to the user
    Finished(ClaimReport),
    /// Cancelled while waiting
    Cancelled,
}

/// Remaining spacing for a cycle; never negative
pub fn next_wait(target: Duration, elapsed: Duration) -> Duration {
    target.saturating_sub(elapsed)
}

/// Main polling loop
pub struct SchedulerLoop {
    poller: Arc<dyn AvailabilitySource>,
    resolver: Arc<dyn ClaimResolver>,
    submitter: Arc<dyn ClaimSubmitter>,
    clock: Arc<dyn Clock>,
    target: ClaimTarget,
    config: SchedulerConfig,
    state: LoopState,
    failed_cycles: u32,
    cycle_count: u64,
}

impl SchedulerLoop {
    /// Create the loop; at least one region and one option are required
    pub fn new(
        poller: Arc<dyn AvailabilitySource>,
        resolver: Arc<dyn ClaimResolver>,
        submitter: Arc<dyn ClaimSubmitter>,
        clock: Arc<dyn Clock>,
        target: ClaimTarget,
        config: Option<SchedulerConfig>,
    ) -> Result<Self, ClaimError> {
        if target.regions.is_empty() {
            return Err(ClaimError::Config("no regions to monitor".to_string()));
        }
        if target.option_ids.is_empty() {
            return Err(ClaimError::Config("no options requested".to_string()));
        }

        Ok(Self {
            poller,
            resolver,
            submitter,
            clock,
            target,
            config: config.unwrap_or_default(),
            state: LoopState::Idle,
            failed_cycles: 0,
            cycle_count: 0,
        })
    }

    /// Current state
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Active cycles run so far
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// Minimum spacing between cycles, one request per region
    pub fn target_interval(&self) -> Duration {
        let regions = u32::try_from(self.target.regions.len()).unwrap_or(u32::MAX);
        self.config.per_region_interval.saturating_mul(regions)
    }

    /// Run until a claim succeeds, a fatal error occurs or `cancel` fires
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunOutcome, ClaimError> {
        info!(
            "Monitoring {} regions every {:.1}s during {}",
            self.target.regions.len(),
            self.target_interval().as_secs_f64(),
            self.config.active_window
        );

        loop {
            if cancel.is_cancelled() {
                info!("Polling cancelled");
                return Ok(RunOutcome::Cancelled);
            }

            let wait = match self.run_cycle().await? {
                CycleResult::Finished(report) => return Ok(RunOutcome::Finished(report)),
                CycleResult::Idle { wait } => wait,
                CycleResult::Exhausted {
                    elapsed,
                    wait,
                    reports,
                } => {
                    if !reports.is_empty() {
                        let tried: Vec<String> = reports
                            .iter()
                            .map(|report| format!("{} ({:?})", report.candidate.name, report.outcome))
                            .collect();
                        info!(
                            "Cycle {} tried {} in {:.2}s",
                            self.cycle_count,
                            tried.join(", "),
                            elapsed.as_secs_f64()
                        );
                    }
                    wait
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Polling cancelled");
                    return Ok(RunOutcome::Cancelled);
                }
                _ = sleep(wait) => {}
            }
        }
    }

    /// One pass over every region
    pub async fn run_cycle(&mut self) -> Result<CycleResult, ClaimError> {
        let hour = self.clock.current_hour();
        if !self.config.active_window.contains(hour) {
            self.state = LoopState::Idle;
            info!(
                "Outside active hours {} (now {:02}h), waiting {}s",
                self.config.active_window,
                hour,
                self.config.idle_interval.as_secs()
            );
            return Ok(CycleResult::Idle {
                wait: self.config.idle_interval,
            });
        }

        self.state = LoopState::Polling;
        self.cycle_count += 1;
        let started = Instant::now();

        let mut failed_polls = 0;
        let mut seen_facilities = HashSet::new();
        let mut attempted_keys = HashSet::new();
        let mut reports = Vec::new();

        let poller = Arc::clone(&self.poller);
        let regions = self.target.regions.clone();

        for region in &regions {
            let candidates = match poller.poll(region, &self.target.criteria).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    failed_polls += 1;
                    log_poll_failure(region, &e);
                    continue;
                }
            };

            if candidates.is_empty() {
                continue;
            }
            info!(
                "Found {} facilities with stock in {}",
                candidates.len(),
                region
            );

            for candidate in candidates {
                if !seen_facilities.insert(candidate.facility_id.clone()) {
                    debug!("{} already checked this cycle", candidate.name);
                    continue;
                }

                if let Some(report) = self.try_candidate(candidate, &mut attempted_keys).await? {
                    if report.outcome.is_terminal_success() {
                        self.state = LoopState::Done;
                        return Ok(CycleResult::Finished(report));
                    }
                    reports.push(report);
                }
                self.state = LoopState::Polling;
            }
        }

        self.track_failures(failed_polls)?;

        let elapsed = started.elapsed();
        let wait = next_wait(self.target_interval(), elapsed);
        debug!(
            "Cycle {} took {:.2}s, waiting {:.2}s",
            self.cycle_count,
            elapsed.as_secs_f64(),
            wait.as_secs_f64()
        );

        Ok(CycleResult::Exhausted {
            elapsed,
            wait,
            reports,
        })
    }

    /// Walk and, if possible, execute one candidate
    async fn try_candidate(
        &mut self,
        candidate: Candidate,
        attempted_keys: &mut HashSet<String>,
    ) -> Result<Option<ClaimReport>, ClaimError> {
        self.state = LoopState::Resolving;
        info!(
            "Checking {} ({} available)",
            candidate.name, candidate.available_quantity
        );

        let session = match self
            .resolver
            .resolve(&candidate, &self.target.option_ids)
            .await
        {
            Ok(Some(session)) => session,
            Ok(None) => {
                return Ok(Some(ClaimReport {
                    candidate,
                    outcome: ClaimOutcome::OptionUnavailable,
                }));
            }
            Err(ClaimError::AuthenticationExpired) => {
                error!("Credentials rejected while opening {}", candidate.name);
                return Err(ClaimError::AuthenticationExpired);
            }
            Err(e) => {
                warn!("Could not resolve {}: {}", candidate.name, e);
                return Ok(None);
            }
        };

        if !attempted_keys.insert(session.session_key.clone()) {
            debug!("Session {} already attempted", session.session_key);
            return Ok(None);
        }

        let outcome = match self.submitter.execute(session, self.target.mode).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Claim attempt at {} failed: {}", candidate.name, e);
                ClaimOutcome::Indeterminate
            }
        };
        info!("{}: {:?}", candidate.name, outcome);

        Ok(Some(ClaimReport { candidate, outcome }))
    }

    /// Stop once every poll has failed for too many cycles in a row
    fn track_failures(&mut self, failed_polls: usize) -> Result<(), ClaimError> {
        if failed_polls < self.target.regions.len() {
            self.failed_cycles = 0;
            return Ok(());
        }

        self.failed_cycles += 1;
        warn!(
            "Every poll failed, {} cycles in a row",
            self.failed_cycles
        );

        if self.config.max_failed_cycles > 0 && self.failed_cycles >= self.config.max_failed_cycles
        {
            error!("Polling keeps failing; credentials or network need attention");
            return Err(ClaimError::PersistentFailure(self.failed_cycles));
        }
        Ok(())
    }
}

fn log_poll_failure(region: &Region, err: &ClaimError) {
    match err {
        ClaimError::Timeout(_) => warn!("Search timed out for {}", region),
        ClaimError::Transport(e) => warn!("Search connection failed for {}: {}", region, e),
        ClaimError::MalformedResponse(e) => {
            warn!("Search response unusable for {}: {}", region, e)
        }
        ClaimError::UnexpectedStatus(code) => {
            warn!("Search returned HTTP {} for {}", code, region)
        }
        other => error!("Search failed for {}: {}", region, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type ResolveFn = dyn Fn(&Candidate) -> Result<Option<ClaimSession>, ClaimError> + Send + Sync;
    type OutcomeFn = dyn Fn(&ClaimSession) -> ClaimOutcome + Send + Sync;

    /// Poller that replays scripted responses, then returns nothing
    #[derive(Default)]
    struct ScriptedPoller {
        responses: Mutex<VecDeque<Result<Vec<Candidate>, ClaimError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedPoller {
        fn new(responses: Vec<Result<Vec<Candidate>, ClaimError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AvailabilitySource for ScriptedPoller {
        async fn poll(
            &self,
            _region: &Region,
            _criteria: &SearchCriteria,
        ) -> Result<Vec<Candidate>, ClaimError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Vec::new()))
        }
    }

    struct FakeResolver {
        resolve: Box<ResolveFn>,
        calls: AtomicUsize,
    }

    impl FakeResolver {
        fn new(
            resolve: impl Fn(&Candidate) -> Result<Option<ClaimSession>, ClaimError>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            Self {
                resolve: Box::new(resolve),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ClaimResolver for FakeResolver {
        async fn resolve(
            &self,
            candidate: &Candidate,
            _option_ids: &[String],
        ) -> Result<Option<ClaimSession>, ClaimError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.resolve)(candidate)
        }
    }

    struct FakeSubmitter {
        outcome: Box<OutcomeFn>,
        executed: Mutex<Vec<String>>,
    }

    impl FakeSubmitter {
        fn new(outcome: impl Fn(&ClaimSession) -> ClaimOutcome + Send + Sync + 'static) -> Self {
            Self {
                outcome: Box::new(outcome),
                executed: Mutex::new(Vec::new()),
            }
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClaimSubmitter for FakeSubmitter {
        async fn execute(
            &self,
            session: ClaimSession,
            _mode: ClaimMode,
        ) -> Result<ClaimOutcome, ClaimError> {
            self.executed
                .lock()
                .unwrap()
                .push(session.session_key.clone());
            Ok((self.outcome)(&session))
        }
    }

    struct FixedClock(u32);

    impl Clock for FixedClock {
        fn current_hour(&self) -> u32 {
            self.0
        }
    }

    fn candidate(id: &str, quantity: u32) -> Candidate {
        Candidate {
            facility_id: id.to_string(),
            name: format!("clinic {}", id),
            organization_code: format!("ORG{}", id),
            available_quantity: AvailableQuantity::Known(quantity),
        }
    }

    fn session_for(candidate: &Candidate) -> ClaimSession {
        ClaimSession {
            session_key: format!("key-{}", candidate.facility_id),
            option_id: "VEN00013".to_string(),
            resolved_url: format!("https://example.com/info?key=key-{}", candidate.facility_id),
        }
    }

    fn target(region_count: usize) -> ClaimTarget {
        let regions = (0..region_count)
            .map(|i| format!("126.{};37.1;127.{};37.2", i, i).parse().unwrap())
            .collect();
        ClaimTarget {
            regions,
            criteria: SearchCriteria::default(),
            option_ids: vec!["VEN00013".to_string()],
            mode: ClaimMode::Automatic,
        }
    }

    fn scheduler(
        poller: Arc<ScriptedPoller>,
        resolver: Arc<FakeResolver>,
        submitter: Arc<FakeSubmitter>,
        hour: u32,
        regions: usize,
        config: SchedulerConfig,
    ) -> SchedulerLoop {
        SchedulerLoop::new(
            poller,
            resolver,
            submitter,
            Arc::new(FixedClock(hour)),
            target(regions),
            Some(config),
        )
        .unwrap()
    }

    #[test]
    fn test_active_window() {
        let day = ActiveWindow::new(9, 18).unwrap();
        assert!(day.contains(9));
        assert!(day.contains(17));
        assert!(!day.contains(18));
        assert!(!day.contains(3));

        let night = ActiveWindow::new(22, 2).unwrap();
        assert!(night.contains(23));
        assert!(night.contains(1));
        assert!(!night.contains(2));
        assert!(!night.contains(12));

        assert!((0..24).all(|h| ActiveWindow::always().contains(h)));
    }

    #[test]
    fn test_active_window_parsing() {
        assert_eq!(
            "9-18".parse::<ActiveWindow>().unwrap(),
            ActiveWindow::new(9, 18).unwrap()
        );
        assert!("9".parse::<ActiveWindow>().is_err());
        assert!("9-24".parse::<ActiveWindow>().is_err());
        assert_eq!(ActiveWindow::default().to_string(), "09-18");
    }

    #[test]
    fn test_next_wait_is_never_negative() {
        assert_eq!(
            next_wait(Duration::from_millis(1400), Duration::from_millis(400)),
            Duration::from_millis(1000)
        );
        assert_eq!(
            next_wait(Duration::from_millis(700), Duration::from_secs(5)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_new_requires_regions_and_options() {
        let mut empty = target(0);
        let result = SchedulerLoop::new(
            Arc::new(ScriptedPoller::default()),
            Arc::new(FakeResolver::new(|_| Ok(None))),
            Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Claimed)),
            Arc::new(SystemClock),
            empty.clone(),
            None,
        );
        assert!(matches!(result, Err(ClaimError::Config(_))));

        empty.regions = target(1).regions;
        empty.option_ids.clear();
        let result = SchedulerLoop::new(
            Arc::new(ScriptedPoller::default()),
            Arc::new(FakeResolver::new(|_| Ok(None))),
            Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Claimed)),
            Arc::new(SystemClock),
            empty,
            None,
        );
        assert!(matches!(result, Err(ClaimError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_poll_waits_target_interval() {
        let poller = Arc::new(ScriptedPoller::new(vec![Ok(vec![]), Ok(vec![])]));
        let resolver = Arc::new(FakeResolver::new(|_| Ok(None)));
        let submitter = Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Claimed));
        let mut scheduler = scheduler(
            poller.clone(),
            resolver.clone(),
            submitter,
            10,
            2,
            SchedulerConfig::default(),
        );

        let result = scheduler.run_cycle().await.unwrap();

        match result {
            CycleResult::Exhausted { wait, reports, .. } => {
                assert_eq!(wait, Duration::from_millis(1400));
                assert!(reports.is_empty());
            }
            other => panic!("unexpected cycle result: {:?}", other),
        }
        assert_eq!(poller.calls(), 2);
        assert_eq!(resolver.calls(), 0);
        assert_eq!(scheduler.state(), LoopState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_option_moves_on_without_claiming() {
        let poller = Arc::new(ScriptedPoller::new(vec![Ok(vec![candidate("1", 5)])]));
        let resolver = Arc::new(FakeResolver::new(|_| Ok(None)));
        let submitter = Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Claimed));
        let mut scheduler = scheduler(
            poller.clone(),
            resolver.clone(),
            submitter.clone(),
            10,
            2,
            SchedulerConfig::default(),
        );

        let result = scheduler.run_cycle().await.unwrap();

        match result {
            CycleResult::Exhausted { reports, .. } => {
                assert_eq!(reports.len(), 1);
                assert_eq!(reports[0].outcome, ClaimOutcome::OptionUnavailable);
            }
            other => panic!("unexpected cycle result: {:?}", other),
        }
        assert_eq!(poller.calls(), 2);
        assert_eq!(resolver.calls(), 1);
        assert!(submitter.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_success_stops_immediately() {
        let poller = Arc::new(ScriptedPoller::new(vec![Ok(vec![
            candidate("1", 5),
            candidate("2", 3),
        ])]));
        let resolver = Arc::new(FakeResolver::new(|c| Ok(Some(session_for(c)))));
        let submitter = Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Claimed));
        let mut scheduler = scheduler(
            poller.clone(),
            resolver.clone(),
            submitter.clone(),
            10,
            3,
            SchedulerConfig::default(),
        );

        let result = scheduler.run_cycle().await.unwrap();

        match result {
            CycleResult::Finished(report) => {
                assert_eq!(report.outcome, ClaimOutcome::Claimed);
                assert_eq!(report.candidate.facility_id, "1");
            }
            other => panic!("unexpected cycle result: {:?}", other),
        }
        assert_eq!(poller.calls(), 1);
        assert_eq!(resolver.calls(), 1);
        assert_eq!(submitter.executed(), vec!["key-1".to_string()]);
        assert_eq!(scheduler.state(), LoopState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_continues_to_next_candidate() {
        let poller = Arc::new(ScriptedPoller::new(vec![Ok(vec![
            candidate("1", 5),
            candidate("2", 3),
        ])]));
        let resolver = Arc::new(FakeResolver::new(|c| Ok(Some(session_for(c)))));
        let submitter = Arc::new(FakeSubmitter::new(|session| {
            if session.session_key == "key-1" {
                ClaimOutcome::Rejected
            } else {
                ClaimOutcome::Claimed
            }
        }));
        let mut scheduler = scheduler(
            poller,
            resolver,
            submitter.clone(),
            10,
            1,
            SchedulerConfig::default(),
        );

        let result = scheduler.run_cycle().await.unwrap();

        match result {
            CycleResult::Finished(report) => assert_eq!(report.candidate.facility_id, "2"),
            other => panic!("unexpected cycle result: {:?}", other),
        }
        assert_eq!(
            submitter.executed(),
            vec!["key-1".to_string(), "key-2".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_outside_active_window_does_not_poll() {
        let poller = Arc::new(ScriptedPoller::default());
        let resolver = Arc::new(FakeResolver::new(|_| Ok(None)));
        let submitter = Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Claimed));
        let mut scheduler = scheduler(
            poller.clone(),
            resolver,
            submitter,
            3,
            2,
            SchedulerConfig::default(),
        );

        let result = scheduler.run_cycle().await.unwrap();

        assert!(matches!(
            result,
            CycleResult::Idle { wait } if wait == Duration::from_secs(600)
        ));
        assert_eq!(poller.calls(), 0);
        assert_eq!(scheduler.state(), LoopState::Idle);
        assert_eq!(scheduler.cycle_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_session_is_executed_once_per_cycle() {
        let poller = Arc::new(ScriptedPoller::new(vec![Ok(vec![
            candidate("1", 5),
            candidate("2", 5),
        ])]));
        // Both facilities resolve to the same claim session
        let resolver = Arc::new(FakeResolver::new(|c| {
            Ok(Some(ClaimSession {
                session_key: "shared".to_string(),
                ..session_for(c)
            }))
        }));
        let submitter = Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Indeterminate));
        let mut scheduler = scheduler(
            poller,
            resolver.clone(),
            submitter.clone(),
            10,
            1,
            SchedulerConfig::default(),
        );

        scheduler.run_cycle().await.unwrap();

        assert_eq!(resolver.calls(), 2);
        assert_eq!(submitter.executed(), vec!["shared".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_facility_seen_in_two_regions_is_checked_once() {
        let poller = Arc::new(ScriptedPoller::new(vec![
            Ok(vec![candidate("1", 5)]),
            Ok(vec![candidate("1", 5)]),
        ]));
        let resolver = Arc::new(FakeResolver::new(|_| Ok(None)));
        let submitter = Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Claimed));
        let mut scheduler = scheduler(
            poller,
            resolver.clone(),
            submitter,
            10,
            2,
            SchedulerConfig::default(),
        );

        scheduler.run_cycle().await.unwrap();

        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_poll_failure_is_surfaced() {
        let poller = Arc::new(ScriptedPoller::new(vec![
            Err(ClaimError::Timeout("t".to_string())),
            Err(ClaimError::MalformedResponse("m".to_string())),
            Err(ClaimError::Transport("r".to_string())),
        ]));
        let resolver = Arc::new(FakeResolver::new(|_| Ok(None)));
        let submitter = Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Claimed));
        let config = SchedulerConfig {
            max_failed_cycles: 2,
            ..SchedulerConfig::default()
        };
        let mut scheduler = scheduler(poller, resolver, submitter, 10, 1, config);

        assert!(scheduler.run_cycle().await.is_ok());
        assert!(matches!(
            scheduler.run_cycle().await,
            Err(ClaimError::PersistentFailure(2))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_resets_failure_streak() {
        let poller = Arc::new(ScriptedPoller::new(vec![
            Err(ClaimError::Timeout("t".to_string())),
            Err(ClaimError::Timeout("t".to_string())),
            Ok(vec![]),
            Err(ClaimError::Timeout("t".to_string())),
            Err(ClaimError::Timeout("t".to_string())),
        ]));
        let resolver = Arc::new(FakeResolver::new(|_| Ok(None)));
        let submitter = Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Claimed));
        let config = SchedulerConfig {
            max_failed_cycles: 2,
            ..SchedulerConfig::default()
        };
        let mut scheduler = scheduler(poller, resolver, submitter, 10, 2, config);

        assert!(scheduler.run_cycle().await.is_ok());
        assert!(scheduler.run_cycle().await.is_ok());
        assert!(scheduler.run_cycle().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_credentials_stop_the_loop() {
        let poller = Arc::new(ScriptedPoller::new(vec![Ok(vec![candidate("1", 5)])]));
        let resolver = Arc::new(FakeResolver::new(|_| Err(ClaimError::AuthenticationExpired)));
        let submitter = Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Claimed));
        let mut scheduler = scheduler(
            poller,
            resolver,
            submitter,
            10,
            1,
            SchedulerConfig::default(),
        );

        assert!(matches!(
            scheduler.run_cycle().await,
            Err(ClaimError::AuthenticationExpired)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_claimed() {
        let poller = Arc::new(ScriptedPoller::new(vec![
            Ok(vec![]),
            Err(ClaimError::Timeout("t".to_string())),
            Ok(vec![candidate("7", 1)]),
        ]));
        let resolver = Arc::new(FakeResolver::new(|c| Ok(Some(session_for(c)))));
        let submitter = Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Available));
        let mut scheduler = scheduler(
            poller.clone(),
            resolver,
            submitter,
            10,
            1,
            SchedulerConfig::default(),
        );

        let outcome = scheduler.run(CancellationToken::new()).await.unwrap();

        match outcome {
            RunOutcome::Finished(report) => {
                assert_eq!(report.outcome, ClaimOutcome::Available);
                assert_eq!(report.candidate.facility_id, "7");
            }
            other => panic!("unexpected run outcome: {:?}", other),
        }
        assert_eq!(poller.calls(), 3);
        assert_eq!(scheduler.cycle_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_honours_cancellation_while_idle() {
        let poller = Arc::new(ScriptedPoller::default());
        let resolver = Arc::new(FakeResolver::new(|_| Ok(None)));
        let submitter = Arc::new(FakeSubmitter::new(|_| ClaimOutcome::Claimed));
        let mut scheduler = scheduler(
            poller.clone(),
            resolver,
            submitter,
            3,
            1,
            SchedulerConfig::default(),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1500)).await;
            trigger.cancel();
        });

        let outcome = scheduler.run(cancel).await.unwrap();

        assert!(matches!(outcome, RunOutcome::Cancelled));
        assert_eq!(poller.calls(), 0);
    }
}
