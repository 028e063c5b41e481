//! An [`Arbiter`] wired to recording doubles and a mock clock.
//!
//! Time only moves when a test calls [`Harness::advance`], which then fires
//! every timer that became due. All operations panic on error with the
//! operation name, so tests read as a straight script.

use std::sync::Arc;
use std::time::Duration;

use meridian_common::{
    ArbiterError, Capability, LinkProperties, NetId, NetworkCapabilities, NetworkScore, RequestId,
    Transport, UidRangeSet,
};
use meridian_core::{
    AgentConfig, Arbiter, ArbiterConfig, Caller, Dependencies, RequestOptions, ValidationResult,
    VpnType,
};
use meridian_mroute::CoordinatorConfig;
use quanta::{Clock, Instant, Mock};
use tracing::debug;

use crate::agent::ScriptedAgent;
use crate::backend::RecordingBackend;
use crate::callback::TestCallback;
use crate::kernel::RecordingKernel;
use crate::policy::FakePolicy;

#[track_caller]
fn ok<T>(what: &str, result: Result<T, ArbiterError>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("{what} failed: {e}"),
    }
}

/// Everything needed to register one network.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub caps: NetworkCapabilities,
    pub score: NetworkScore,
    pub link_properties: LinkProperties,
    pub config: AgentConfig,
}

impl NetworkSpec {
    fn base(transport: Transport, iface: &str) -> Self {
        let caps = NetworkCapabilities::new()
            .with_transport(transport)
            .with_capability(Capability::Internet)
            .with_capability(Capability::NotRestricted)
            .with_capability(Capability::Trusted)
            .with_capability(Capability::NotVpn)
            .with_capability(Capability::NotSuspended)
            .with_capability(Capability::NotRoaming)
            .with_capability(Capability::NotCongested)
            .with_capability(Capability::NotVcnManaged);
        Self {
            caps,
            score: NetworkScore::default(),
            link_properties: LinkProperties::with_interface(iface),
            config: AgentConfig::default(),
        }
    }

    /// Unmetered Wi-Fi on `wlan0`.
    pub fn wifi() -> Self {
        let mut spec = Self::base(Transport::Wifi, "wlan0");
        spec.caps = spec.caps.with_capability(Capability::NotMetered);
        spec
    }

    /// Metered cellular on `rmnet0`.
    pub fn cellular() -> Self {
        Self::base(Transport::Cellular, "rmnet0")
    }

    pub fn ethernet() -> Self {
        let mut spec = Self::base(Transport::Ethernet, "eth0");
        spec.caps = spec.caps.with_capability(Capability::NotMetered);
        spec
    }

    /// Service VPN on `tun0` applying to `uids`.
    pub fn vpn(uids: UidRangeSet) -> Self {
        let mut spec = Self::base(Transport::Vpn, "tun0");
        spec.caps = spec
            .caps
            .without_capability(Capability::NotVpn)
            .with_uids(Some(uids));
        spec.config.vpn_type = Some(VpnType::Service);
        spec
    }

    pub fn with_score(mut self, legacy_int: i32) -> Self {
        self.score.legacy_int = legacy_int;
        self
    }

    pub fn with_network_score(mut self, score: NetworkScore) -> Self {
        self.score = score;
        self
    }

    pub fn with_capability(mut self, c: Capability) -> Self {
        self.caps = self.caps.with_capability(c);
        self
    }

    pub fn without_capability(mut self, c: Capability) -> Self {
        self.caps = self.caps.without_capability(c);
        self
    }

    pub fn with_caps(mut self, f: impl FnOnce(NetworkCapabilities) -> NetworkCapabilities) -> Self {
        self.caps = f(self.caps);
        self
    }

    pub fn with_interface(mut self, iface: &str) -> Self {
        self.link_properties = LinkProperties::with_interface(iface);
        self
    }

    pub fn with_agent_config(mut self, f: impl FnOnce(&mut AgentConfig)) -> Self {
        f(&mut self.config);
        self
    }
}

/// A registered network and the agent behind it. `caps` and `score` track
/// what the agent last declared.
#[derive(Clone)]
pub struct TestNetwork {
    pub id: NetId,
    pub agent: Arc<ScriptedAgent>,
    pub caps: NetworkCapabilities,
    pub score: NetworkScore,
}

pub struct Harness {
    pub arbiter: Arbiter,
    pub backend: Arc<RecordingBackend>,
    pub policy: Arc<FakePolicy>,
    pub clock: Clock,
    mock: Arc<Mock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ArbiterConfig::default())
    }

    pub fn with_config(config: ArbiterConfig) -> Self {
        Self::with_policy(config, Arc::new(FakePolicy::new()))
    }

    /// Harness whose arbiter sees `policy` from the start, for tests that
    /// need packages or users in place before the first rematch.
    pub fn with_policy(config: ArbiterConfig, policy: Arc<FakePolicy>) -> Self {
        let (clock, mock) = Clock::mock();
        // Keep instants away from zero so "now minus a delay" never saturates.
        mock.increment(Duration::from_secs(1));
        let backend = Arc::new(RecordingBackend::new());
        let deps = Dependencies {
            backend: Arc::clone(&backend) as _,
            policy: Arc::clone(&policy) as _,
        };
        let arbiter = Arbiter::new(config, deps, clock.clone());
        Self {
            arbiter,
            backend,
            policy,
            clock,
            mock,
        }
    }

    /// The backend and policy this harness hands to its arbiter.
    pub fn dependencies(&self) -> Dependencies {
        Dependencies {
            backend: Arc::clone(&self.backend) as _,
            policy: Arc::clone(&self.policy) as _,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Moves the mock clock forward and fires whatever became due.
    pub fn advance(&mut self, d: Duration) {
        self.mock.increment(d);
        self.arbiter.process_timers();
    }

    /// Like [`advance`](Self::advance) in `step` increments, so timers
    /// scheduled by earlier timers fire at their own deadline.
    pub fn advance_by_steps(&mut self, total: Duration, step: Duration) {
        let mut left = total;
        while !left.is_zero() {
            let d = left.min(step);
            self.advance(d);
            left -= d;
        }
    }

    pub fn attach_multicast(&mut self, kernel: RecordingKernel, config: CoordinatorConfig) {
        self.arbiter.attach_multicast(Box::new(kernel), config);
    }

    // ─── Networks ───────────────────────────────────────────────────────

    #[track_caller]
    pub fn register(&mut self, spec: NetworkSpec) -> TestNetwork {
        let agent = Arc::new(ScriptedAgent::new());
        let id = ok(
            "register_network_agent",
            self.arbiter.register_network_agent(
                Arc::clone(&agent) as _,
                spec.config,
                spec.caps.clone(),
                spec.link_properties,
                spec.score,
            ),
        );
        debug!(net = %id, "harness registered network");
        TestNetwork {
            id,
            agent,
            caps: spec.caps,
            score: spec.score,
        }
    }

    /// Registers and connects, leaving the network unvalidated.
    #[track_caller]
    pub fn connect(&mut self, spec: NetworkSpec) -> TestNetwork {
        let net = self.register(spec);
        ok("mark_connected", self.arbiter.mark_connected(net.id));
        net
    }

    #[track_caller]
    pub fn connect_validated(&mut self, spec: NetworkSpec) -> TestNetwork {
        let net = self.connect(spec);
        self.validate(&net);
        net
    }

    #[track_caller]
    pub fn validate(&mut self, net: &TestNetwork) {
        ok(
            "report_validation",
            self.arbiter.report_validation(net.id, ValidationResult::valid()),
        );
    }

    #[track_caller]
    pub fn invalidate(&mut self, net: &TestNetwork) {
        ok(
            "report_validation",
            self.arbiter.report_validation(net.id, ValidationResult::invalid()),
        );
    }

    #[track_caller]
    pub fn set_score(&mut self, net: &mut TestNetwork, legacy_int: i32) {
        net.score.legacy_int = legacy_int;
        ok("update_score", self.arbiter.update_score(net.id, net.score));
    }

    /// Adds or drops a mutable capability and resends the declared set.
    #[track_caller]
    pub fn set_capability(&mut self, net: &mut TestNetwork, c: Capability, on: bool) {
        net.caps.set_capability(c, on);
        ok(
            "update_capabilities",
            self.arbiter.update_capabilities(net.id, net.caps.clone()),
        );
    }

    #[track_caller]
    pub fn disconnect(&mut self, net: &TestNetwork) {
        ok("agent_disconnected", self.arbiter.agent_disconnected(net.id));
    }

    // ─── Requests ───────────────────────────────────────────────────────

    #[track_caller]
    pub fn request(&mut self, uid: u32, caps: NetworkCapabilities) -> (RequestId, Arc<TestCallback>) {
        let cb = TestCallback::new();
        let id = ok(
            "request_network",
            self.arbiter.request_network(
                Caller::new(uid),
                caps,
                cb.listener(),
                RequestOptions::default(),
            ),
        );
        (id, cb)
    }

    #[track_caller]
    pub fn listen(&mut self, uid: u32, caps: NetworkCapabilities) -> (RequestId, Arc<TestCallback>) {
        let cb = TestCallback::new();
        let id = ok(
            "listen_network",
            self.arbiter.listen_network(
                Caller::new(uid),
                caps,
                cb.listener(),
                RequestOptions::default(),
            ),
        );
        (id, cb)
    }

    #[track_caller]
    pub fn default_callback(&mut self, uid: u32) -> (RequestId, Arc<TestCallback>) {
        let cb = TestCallback::new();
        let id = ok(
            "register_default_network_callback",
            self.arbiter
                .register_default_network_callback(Caller::new(uid), cb.listener()),
        );
        (id, cb)
    }

    /// Grants `uid` network settings if needed, then follows the system
    /// default network.
    #[track_caller]
    pub fn system_default_callback(&mut self, uid: u32) -> (RequestId, Arc<TestCallback>) {
        self.policy
            .grant(uid, meridian_core::Permission::NetworkSettings);
        let cb = TestCallback::new();
        let id = ok(
            "register_system_default_network_callback",
            self.arbiter
                .register_system_default_network_callback(Caller::new(uid), cb.listener()),
        );
        (id, cb)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter most app tests use: the request defaults plus INTERNET.
pub fn internet() -> NetworkCapabilities {
    NetworkCapabilities::request_default().with_capability(Capability::Internet)
}
