use std::time::Duration;
use tokio::time::Instant;
use vault_client::Credential;

const RENEW_WINDOW_START: f64 = 0.7;
const RENEW_WINDOW_WIDTH: f64 = 0.2;
const RENEW_GIVE_UP: f64 = 0.95;
const MIN_RELOGIN_DELAY: Duration = Duration::from_secs(1);

/// What the handler does next with a fresh credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextAction {
    /// Non-expiring credential: wait for a new-credential notice or shutdown.
    Idle,
    Renew(Instant),
    Relogin(Instant),
}

/// Picks the next action for `credential`.
///
/// `u` in `[0, 1]` places the renewal inside `[0.7L, 0.9L]` after issuance.
/// Non-renewable credentials are replaced at `max(L - margin, L / 2)`, never
/// sooner than one second after issuance.
pub(crate) fn plan(credential: &Credential, safety_margin: Duration, u: f64) -> NextAction {
    let lease = credential.lease_duration;
    if lease.is_zero() {
        return NextAction::Idle;
    }

    if !credential.renewable {
        let delay = lease
            .saturating_sub(safety_margin)
            .max(lease / 2)
            .max(MIN_RELOGIN_DELAY);
        return NextAction::Relogin(credential.issued_at + delay);
    }

    let fraction = RENEW_WINDOW_START + RENEW_WINDOW_WIDTH * u.clamp(0.0, 1.0);
    NextAction::Renew(credential.issued_at + lease.mul_f64(fraction))
}

/// Past this instant a failing renewal is abandoned for a fresh login.
pub(crate) fn renewal_deadline(credential: &Credential) -> Instant {
    credential.issued_at + credential.lease_duration.mul_f64(RENEW_GIVE_UP)
}
