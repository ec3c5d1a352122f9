use robust_core::command::User;

/// Authentication state for one connection's lifetime. Mutated only by the
/// auth handler; there is no logout, so it never rolls back.
#[derive(Debug, Default)]
pub struct Session {
    authenticated: bool,
    user: Option<User>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    /// Marks the session authenticated. Authenticated always implies a
    /// present user, so both fields flip together.
    pub fn set_user(&mut self, user: User) {
        self.user = Some(user);
        self.authenticated = true;
    }
}
