use log::{info, warn};

use crate::{error::ErrorKind, locator::Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    CheckingPrimaryVersion,
    CheckingSecondaryVersion,
    Updating,
    Rebooting,
    Failed,
}

impl UpdateState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::CheckingPrimaryVersion => "CHECKING_PRIMARY",
            Self::CheckingSecondaryVersion => "CHECKING_SECONDARY",
            Self::Updating => "UPDATING",
            Self::Rebooting => "REBOOTING",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailoverState {
    use_backup_urls: bool,
}

impl FailoverState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(&self) -> Source {
        if self.use_backup_urls {
            Source::Secondary
        } else {
            Source::Primary
        }
    }

    pub fn fail_over(&mut self) -> bool {
        if self.use_backup_urls {
            return false;
        }
        self.use_backup_urls = true;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
    Newer(i64),
    NotNewer(i64),
}

impl VersionStatus {
    pub fn compare(current: i64, available: i64) -> Self {
        if available > current {
            Self::Newer(available)
        } else {
            Self::NotNewer(available)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiated {
    Proceed { source: Source, available: i64 },
    UpToDate { available: i64 },
    NotNewerOnSecondary { available: i64 },
    Failed { last_error: ErrorKind },
}

#[derive(Debug)]
pub struct Negotiation {
    state: UpdateState,
    failover: FailoverState,
    history: Vec<UpdateState>,
}

impl Default for Negotiation {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiation {
    pub fn new() -> Self {
        Self {
            state: UpdateState::Idle,
            failover: FailoverState::new(),
            history: vec![UpdateState::Idle],
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn source(&self) -> Source {
        self.failover.source()
    }

    pub fn history(&self) -> &[UpdateState] {
        &self.history
    }

    pub fn transition(&mut self, next: UpdateState) {
        self.state = next;
        self.history.push(next);
    }

    pub fn bypass(&mut self) {
        warn!("version checking disabled; the artifact is applied unconditionally");
        self.transition(UpdateState::Updating);
    }

    pub fn run<F>(&mut self, mut check: F) -> Negotiated
    where
        F: FnMut(Source) -> Result<VersionStatus, ErrorKind>,
    {
        self.failover = FailoverState::new();
        self.transition(UpdateState::CheckingPrimaryVersion);

        let source = self.failover.source();
        match check(source) {
            Ok(VersionStatus::Newer(available)) => {
                self.transition(UpdateState::Updating);
                return Negotiated::Proceed { source, available };
            }
            Ok(VersionStatus::NotNewer(available)) => {
                self.transition(UpdateState::Idle);
                return Negotiated::UpToDate { available };
            }
            Err(err) => {
                if !self.failover.fail_over() {
                    warn!("{source:?} version check failed: {err}; no server left");
                    self.transition(UpdateState::Failed);
                    return Negotiated::Failed { last_error: err };
                }
                warn!("primary version check failed: {err}; trying the secondary server");
            }
        }

        self.transition(UpdateState::CheckingSecondaryVersion);
        let source = self.failover.source();
        match check(source) {
            Ok(VersionStatus::Newer(available)) => {
                self.transition(UpdateState::Updating);
                Negotiated::Proceed { source, available }
            }
            Ok(VersionStatus::NotNewer(available)) => {
                info!("secondary server has no newer version ({available})");
                self.transition(UpdateState::Failed);
                Negotiated::NotNewerOnSecondary { available }
            }
            Err(last_error) => {
                warn!("secondary version check also failed: {last_error}; giving up");
                self.transition(UpdateState::Failed);
                Negotiated::Failed { last_error }
            }
        }
    }
}

// Integer prefix of a plain-text version body. Surrounding whitespace is
// tolerated; anything unparsable reads as 0.
pub fn parse_version(body: &[u8]) -> i64 {
    let text = String::from_utf8_lossy(body);
    let text = text.trim_start();
    let (sign, digits) = match text.as_bytes().first() {
        Some(b'-') => (-1, &text[1..]),
        Some(b'+') => (1, &text[1..]),
        _ => (1, text),
    };
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end]
        .parse::<i64>()
        .map(|value| sign * value)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn version_comparison_boundaries() {
        assert_eq!(VersionStatus::compare(5, 5), VersionStatus::NotNewer(5));
        assert_eq!(VersionStatus::compare(5, 6), VersionStatus::Newer(6));
        assert_eq!(VersionStatus::compare(5, 4), VersionStatus::NotNewer(4));
    }

    #[test]
    fn parses_version_bodies() {
        assert_eq!(parse_version(b"12"), 12);
        assert_eq!(parse_version(b"  7\n"), 7);
        assert_eq!(parse_version(b"11abc"), 11);
        assert_eq!(parse_version(b"-3"), -3);
        assert_eq!(parse_version(b"<html>"), 0);
        assert_eq!(parse_version(b""), 0);
    }

    #[test]
    fn failover_flips_once() {
        let mut failover = FailoverState::new();
        assert_eq!(failover.source(), Source::Primary);
        assert!(failover.fail_over());
        assert!(!failover.fail_over());
        assert_eq!(failover.source(), Source::Secondary);
    }

    #[test]
    fn primary_newer_proceeds_without_secondary() {
        let mut calls = Vec::new();
        let mut negotiation = Negotiation::new();
        let outcome = negotiation.run(|source| {
            calls.push(source);
            Ok(VersionStatus::compare(5, 6))
        });

        assert_eq!(
            outcome,
            Negotiated::Proceed {
                source: Source::Primary,
                available: 6
            }
        );
        assert_eq!(calls, vec![Source::Primary]);
        assert_eq!(negotiation.state(), UpdateState::Updating);
    }

    #[test]
    fn primary_up_to_date_ends_cycle() {
        let mut calls = 0;
        let mut negotiation = Negotiation::new();
        let outcome = negotiation.run(|_| {
            calls += 1;
            Ok(VersionStatus::compare(5, 5))
        });

        assert_eq!(outcome, Negotiated::UpToDate { available: 5 });
        assert_eq!(calls, 1);
        assert_eq!(
            negotiation.history(),
            &[
                UpdateState::Idle,
                UpdateState::CheckingPrimaryVersion,
                UpdateState::Idle
            ]
        );
    }

    #[test]
    fn transport_failure_tries_secondary_exactly_once() {
        let mut calls = Vec::new();
        let mut negotiation = Negotiation::new();
        let outcome = negotiation.run(|source| {
            calls.push(source);
            Err(ErrorKind::TransportFailure(-1))
        });

        assert_eq!(
            outcome,
            Negotiated::Failed {
                last_error: ErrorKind::TransportFailure(-1)
            }
        );
        assert_eq!(calls, vec![Source::Primary, Source::Secondary]);
        assert_eq!(negotiation.state(), UpdateState::Failed);
    }

    #[test]
    fn secondary_rescues_primary_failure() {
        let mut negotiation = Negotiation::new();
        let outcome = negotiation.run(|source| match source {
            Source::Primary => Err(ErrorKind::HttpFailure(404)),
            Source::Secondary => Ok(VersionStatus::compare(3, 4)),
        });

        assert_eq!(
            outcome,
            Negotiated::Proceed {
                source: Source::Secondary,
                available: 4
            }
        );
        assert_eq!(negotiation.source(), Source::Secondary);
        assert_eq!(
            negotiation.history(),
            &[
                UpdateState::Idle,
                UpdateState::CheckingPrimaryVersion,
                UpdateState::CheckingSecondaryVersion,
                UpdateState::Updating
            ]
        );
    }

    #[test]
    fn each_run_starts_from_primary() {
        let mut negotiation = Negotiation::new();
        negotiation.run(|source| match source {
            Source::Primary => Err(ErrorKind::HttpFailure(500)),
            Source::Secondary => Ok(VersionStatus::compare(3, 3)),
        });
        assert_eq!(negotiation.source(), Source::Secondary);

        let mut calls = Vec::new();
        let outcome = negotiation.run(|source| {
            calls.push(source);
            Ok(VersionStatus::compare(3, 5))
        });

        assert_eq!(calls, vec![Source::Primary]);
        assert_eq!(
            outcome,
            Negotiated::Proceed {
                source: Source::Primary,
                available: 5
            }
        );
        assert_eq!(negotiation.source(), Source::Primary);
    }

    #[test]
    fn secondary_not_newer_is_failure() {
        let mut negotiation = Negotiation::new();
        let outcome = negotiation.run(|source| match source {
            Source::Primary => Err(ErrorKind::Redirected(301)),
            Source::Secondary => Ok(VersionStatus::compare(3, 3)),
        });

        assert_eq!(outcome, Negotiated::NotNewerOnSecondary { available: 3 });
        assert_eq!(negotiation.state(), UpdateState::Failed);
    }
}
