// ABOUTME: Per-process role detection, decided once at process entry
//
// Children are launched with ROLE_ENV set to their worker id; the primary never
// has it. The resulting ClusterContext is passed explicitly to whoever needs it.

use std::fmt;

use crate::worker::WorkerId;

/// Environment variable marking a worker process; holds the worker id.
pub const ROLE_ENV: &str = "PREFORK_WORKER_ID";

/// Which side of the cluster this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Primary,
    Worker(WorkerId),
}

impl Role {
    #[must_use]
    pub const fn is_primary(self) -> bool {
        matches!(self, Self::Primary)
    }

    #[must_use]
    pub const fn worker_id(self) -> Option<WorkerId> {
        match self {
            Self::Primary => None,
            Self::Worker(id) => Some(id),
        }
    }

    /// Role implied by a raw `ROLE_ENV` value.
    ///
    /// Any present value marks a worker; unparsable ids map to worker 0.
    #[must_use]
    pub fn from_marker(marker: Option<&str>) -> Self {
        match marker {
            None => Self::Primary,
            Some(value) => Self::Worker(WorkerId(value.trim().parse().unwrap_or(0))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Worker(id) => write!(f, "worker {id}"),
        }
    }
}

/// Process-wide cluster facts, constructed once in `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterContext {
    role: Role,
}

impl ClusterContext {
    /// Inspect the environment of the current process.
    #[must_use]
    pub fn detect() -> Self {
        let marker = std::env::var(ROLE_ENV).ok();
        Self::with_role(Role::from_marker(marker.as_deref()))
    }

    #[must_use]
    pub const fn with_role(role: Role) -> Self {
        Self { role }
    }

    #[must_use]
    pub const fn primary() -> Self {
        Self::with_role(Role::Primary)
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn is_primary(&self) -> bool {
        self.role.is_primary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_marker_is_primary() {
        assert_eq!(Role::from_marker(None), Role::Primary);
        assert!(ClusterContext::with_role(Role::from_marker(None)).is_primary());
    }

    #[test]
    fn test_marker_carries_worker_id() {
        assert_eq!(Role::from_marker(Some("7")), Role::Worker(WorkerId(7)));
        assert_eq!(Role::from_marker(Some(" 12\n")), Role::Worker(WorkerId(12)));
    }

    #[test]
    fn test_any_marker_value_means_worker() {
        let role = Role::from_marker(Some("yes"));
        assert!(!role.is_primary());
        assert_eq!(role.worker_id(), Some(WorkerId(0)));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Primary.to_string(), "primary");
        assert_eq!(Role::Worker(WorkerId(3)).to_string(), "worker 3");
    }
}
