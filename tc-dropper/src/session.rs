//! TC hook lifecycle.
//!
//! Loads the compiled classifiers, creates the interface's `clsact` qdisc,
//! attaches the classifier at ingress then egress, and removes both filters
//! again on shutdown. [`Session`] owns the attached hooks: dropping it
//! detaches, so error returns and panics cannot leave an interface
//! half-attached.

use std::fmt;
use std::io;

use anyhow::{Context, Result};
use aya::programs::tc::{self, NlOptions, TcAttachOptions};
use aya::programs::{SchedClassifier, TcAttachType};
use aya::Ebpf;
use tracing::{debug, info, warn};

use crate::state::StateMaps;
use tc_dropper_common::{PROG_EGRESS, PROG_INGRESS};

/// Netlink filter priority used for both classifiers.
const FILTER_PRIORITY: u16 = 1;
/// Netlink filter handle used for both classifiers.
const FILTER_HANDLE: u32 = 1;

// ---------------------------------------------------------------------------
// Attach Points
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachPoint {
    Ingress,
    Egress,
}

impl AttachPoint {
    /// Attach order. Detach walks the same list.
    pub const ALL: [AttachPoint; 2] = [AttachPoint::Ingress, AttachPoint::Egress];

    pub fn program_name(self) -> &'static str {
        match self {
            AttachPoint::Ingress => PROG_INGRESS,
            AttachPoint::Egress => PROG_EGRESS,
        }
    }

    fn attach_type(self) -> TcAttachType {
        match self {
            AttachPoint::Ingress => TcAttachType::Ingress,
            AttachPoint::Egress => TcAttachType::Egress,
        }
    }
}

impl fmt::Display for AttachPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachPoint::Ingress => f.write_str("ingress"),
            AttachPoint::Egress => f.write_str("egress"),
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel Operations
// ---------------------------------------------------------------------------

/// The kernel-side TC operations a [`Session`] drives.
pub trait TcHooks {
    /// Create the interface's `clsact` qdisc. `AlreadyExists` if present.
    fn create_hook(&mut self, interface: &str) -> io::Result<()>;

    /// Attach our classifier at `point`.
    fn attach_filter(&mut self, interface: &str, point: AttachPoint) -> Result<()>;

    /// Remove every filter carrying our program name at `point`.
    /// `NotFound` if there is none.
    fn remove_filter(&mut self, interface: &str, point: AttachPoint) -> io::Result<()>;
}

/// [`TcHooks`] backed by the loaded eBPF object.
pub struct EbpfHooks {
    bpf: Ebpf,
}

impl EbpfHooks {
    /// Load the eBPF object and both classifier programs, and take the
    /// state maps out of it. Touches no interface.
    pub fn load(ebpf_bytes: &[u8]) -> Result<(Self, StateMaps)> {
        let mut bpf = Ebpf::load(ebpf_bytes).context("loading eBPF object")?;

        // Forwards the classifiers' aya-log events into tracing.
        if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
            warn!("eBPF logging not available: {}", e);
        }

        for point in AttachPoint::ALL {
            let name = point.program_name();
            let program: &mut SchedClassifier = bpf
                .program_mut(name)
                .with_context(|| format!("eBPF program '{}' not found", name))?
                .try_into()
                .context("program type mismatch (expected SchedClassifier)")?;

            program
                .load()
                .with_context(|| format!("loading TC program '{}'", name))?;
        }

        let maps = StateMaps::take_from(&mut bpf)?;
        Ok((Self { bpf }, maps))
    }
}

impl TcHooks for EbpfHooks {
    fn create_hook(&mut self, interface: &str) -> io::Result<()> {
        tc::qdisc_add_clsact(interface)
    }

    fn attach_filter(&mut self, interface: &str, point: AttachPoint) -> Result<()> {
        let name = point.program_name();
        let program: &mut SchedClassifier = self
            .bpf
            .program_mut(name)
            .with_context(|| format!("eBPF program '{}' not found", name))?
            .try_into()
            .context("program type mismatch (expected SchedClassifier)")?;

        // Netlink rather than TCX so the filter shows up under `tc filter`
        // and can be removed by name after an unclean exit.
        program
            .attach_with_options(
                interface,
                point.attach_type(),
                TcAttachOptions::Netlink(NlOptions {
                    priority: FILTER_PRIORITY,
                    handle: FILTER_HANDLE,
                }),
            )
            .with_context(|| format!("attaching '{}' to TC {}", name, point))?;

        Ok(())
    }

    fn remove_filter(&mut self, interface: &str, point: AttachPoint) -> io::Result<()> {
        tc::qdisc_detach_program(interface, point.attach_type(), point.program_name())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Classifiers attached to one interface. Detaches exactly once: explicitly
/// via [`Session::detach`] or on drop.
pub struct Session<H: TcHooks> {
    hooks: H,
    interface: String,
    detached: bool,
}

impl<H: TcHooks> Session<H> {
    /// Create the hook (idempotent) and attach at ingress, then egress.
    ///
    /// Filters left behind by an earlier run are replaced. If either attach
    /// fails, whatever was attached is removed before the error is returned.
    pub fn attach(mut hooks: H, interface: &str) -> Result<Self> {
        match hooks.create_hook(interface) {
            Ok(()) => debug!(interface, "created clsact qdisc"),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(interface, "clsact qdisc already present")
            }
            Err(e) => return Err(e).context("creating clsact hook"),
        }

        let mut session = Self {
            hooks,
            interface: interface.to_string(),
            detached: false,
        };

        for point in AttachPoint::ALL {
            if let Err(e) = session.attach_point(point) {
                session.detach();
                return Err(e.context(format!("attaching {} classifier", point)));
            }
            info!(interface, attach_point = %point, "attached TC classifier");
        }

        Ok(session)
    }

    fn attach_point(&mut self, point: AttachPoint) -> Result<()> {
        match self.hooks.remove_filter(&self.interface, point) {
            Ok(()) => warn!(
                interface = %self.interface,
                attach_point = %point,
                "replaced stale classifier from a previous run"
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("removing stale classifier"),
        }

        self.hooks.attach_filter(&self.interface, point)
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Remove both classifiers. Best-effort and idempotent: missing filters
    /// are ignored, other failures are logged, and later calls do nothing.
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;

        for point in AttachPoint::ALL {
            match self.hooks.remove_filter(&self.interface, point) {
                Ok(()) => info!(
                    interface = %self.interface,
                    attach_point = %point,
                    "detached TC classifier"
                ),
                Err(e) if e.kind() == io::ErrorKind::NotFound => debug!(
                    interface = %self.interface,
                    attach_point = %point,
                    "no classifier to detach"
                ),
                Err(e) => warn!(
                    interface = %self.interface,
                    attach_point = %point,
                    error = %e,
                    "failed to detach TC classifier"
                ),
            }
        }
    }
}

impl<H: TcHooks> Drop for Session<H> {
    fn drop(&mut self) {
        self.detach();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Get the interface index for a network interface name.
pub fn interface_index(iface: &str) -> Result<u32> {
    let idx = nix::net::if_::if_nametoindex(iface)
        .with_context(|| format!("interface '{}' not found", iface))?;
    Ok(idx)
}


#[cfg(test)]
mod tests {
    use super::testing::{Call, FakeHooks};
    use super::*;

    use AttachPoint::{Egress, Ingress};

    #[test]
    fn test_attach_order() {
        let hooks = FakeHooks::default();
        let session = Session::attach(hooks.clone(), "veth1").unwrap();

        assert_eq!(session.interface(), "veth1");
        assert_eq!(
            hooks.calls(),
            vec![
                Call::CreateHook,
                Call::Remove(Ingress),
                Call::Attach(Ingress),
                Call::Remove(Egress),
                Call::Attach(Egress),
            ]
        );
        assert_eq!(hooks.filters(Ingress), 1);
        assert_eq!(hooks.filters(Egress), 1);
    }

    #[test]
    fn test_detach_runs_once() {
        let hooks = FakeHooks::default();
        let mut session = Session::attach(hooks.clone(), "veth1").unwrap();
        let attach_calls = hooks.calls().len();

        session.detach();
        session.detach();
        drop(session);

        assert_eq!(
            hooks.calls()[attach_calls..],
            [Call::Remove(Ingress), Call::Remove(Egress)]
        );
        assert_eq!(hooks.filters(Ingress), 0);
        assert_eq!(hooks.filters(Egress), 0);
    }

    #[test]
    fn test_drop_detaches() {
        let hooks = FakeHooks::default();
        {
            let _session = Session::attach(hooks.clone(), "veth1").unwrap();
        }
        assert_eq!(hooks.filters(Ingress), 0);
        assert_eq!(hooks.filters(Egress), 0);
    }

    #[test]
    fn test_existing_hook_is_not_an_error() {
        let hooks = FakeHooks::default();
        hooks.0.borrow_mut().hook = true;

        assert!(Session::attach(hooks.clone(), "veth1").is_ok());
    }

    #[test]
    fn test_reattach_after_unclean_exit_does_not_duplicate() {
        let hooks = FakeHooks::default();

        // A run that never got to detach (SIGKILL).
        let first = Session::attach(hooks.clone(), "veth1").unwrap();
        std::mem::forget(first);

        let second = Session::attach(hooks.clone(), "veth1").unwrap();
        assert_eq!(hooks.filters(Ingress), 1);
        assert_eq!(hooks.filters(Egress), 1);

        drop(second);
        assert_eq!(hooks.filters(Ingress), 0);
        assert_eq!(hooks.filters(Egress), 0);
    }

    #[test]
    fn test_hook_creation_failure_touches_nothing() {
        let hooks = FakeHooks::default();
        hooks.0.borrow_mut().fail_create = true;

        let err = Session::attach(hooks.clone(), "veth1").err().unwrap();
        assert!(format!("{:#}", err).contains("creating clsact hook"));
        assert_eq!(hooks.calls(), vec![Call::CreateHook]);
    }

    #[test]
    fn test_egress_failure_cleans_up_ingress() {
        let hooks = FakeHooks::default();
        hooks.0.borrow_mut().fail_attach = Some(Egress);

        let err = Session::attach(hooks.clone(), "veth1").err().unwrap();
        assert!(format!("{:#}", err).contains("attaching egress classifier"));

        assert_eq!(hooks.filters(Ingress), 0);
        assert_eq!(hooks.filters(Egress), 0);
        assert_eq!(
            hooks.calls(),
            vec![
                Call::CreateHook,
                Call::Remove(Ingress),
                Call::Attach(Ingress),
                Call::Remove(Egress),
                Call::Attach(Egress),
                Call::Remove(Ingress),
                Call::Remove(Egress),
            ]
        );
    }

    #[test]
    fn test_ingress_failure_is_fatal_and_cleaned() {
        let hooks = FakeHooks::default();
        hooks.0.borrow_mut().fail_attach = Some(Ingress);

        assert!(Session::attach(hooks.clone(), "veth1").is_err());
        assert!(!hooks.calls().contains(&Call::Attach(Egress)));
        assert_eq!(hooks.filters(Ingress), 0);
    }

    #[test]
    fn test_unknown_interface() {
        assert!(interface_index("tc-dropper-no-such-if0").is_err());
    }
}
