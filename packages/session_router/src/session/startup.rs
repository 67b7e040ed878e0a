//! Startup join: routing begins only once both the caller's profile lookup
//! and the client's `init` request have arrived, in whichever order.

use super::protocol::InitRequest;
use crate::models::UserProfile;

/// Both halves of startup, handed over exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub profile: Option<UserProfile>,
    pub init: InitRequest,
}

#[derive(Debug, Default)]
pub struct StartupJoin {
    /// Outer `Some` once the lookup finished; inner `None` for anonymous users.
    profile: Option<Option<UserProfile>>,
    init: Option<InitRequest>,
    fired: bool,
}

impl StartupJoin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Record the profile lookup result. Later results are ignored.
    pub fn offer_profile(
        &mut self,
        profile: Option<UserProfile>,
        destroyed: bool,
    ) -> Option<JoinOutcome> {
        if self.profile.is_none() {
            self.profile = Some(profile);
        }
        self.try_fire(destroyed)
    }

    /// Record the client's init request. Only the first one counts.
    pub fn offer_init(&mut self, init: InitRequest, destroyed: bool) -> Option<JoinOutcome> {
        if self.init.is_none() && !self.fired {
            self.init = Some(init);
        }
        self.try_fire(destroyed)
    }

    fn try_fire(&mut self, destroyed: bool) -> Option<JoinOutcome> {
        if self.fired || destroyed {
            return None;
        }
        if self.profile.is_none() || self.init.is_none() {
            return None;
        }
        self.fired = true;
        Some(JoinOutcome {
            profile: self.profile.take().flatten(),
            init: self.init.take()?,
        })
    }
}
