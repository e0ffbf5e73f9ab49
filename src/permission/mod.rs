//! Answers "can principal P do action A on resource R".
//!
//! Evaluation is a pure function over an already loaded [`Subject`]; loading
//! is the cache's job. Superusers always pass. Everyone else goes through the
//! layered lookup of [`PermissionSet::lookup`](crate::types::PermissionSet::lookup), and anything not granted by
//! some layer is denied.

use crate::error::{Error, Result};
use crate::types::{Action, RosterRecord, Subject};

#[derive(Debug, Clone, Copy)]
pub struct PermissionEvaluator {
    strict: bool,
}

impl Default for PermissionEvaluator {
    fn default() -> Self {
        Self {
            strict: cfg!(debug_assertions),
        }
    }
}

impl PermissionEvaluator {
    /// In strict mode an unknown action name is an error; otherwise it is
    /// logged and denied. The default is strict in debug builds only.
    #[must_use]
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// `None` stands for a principal that could not be resolved; it is always denied.
    #[must_use]
    pub fn can_perform(
        &self,
        subject: Option<&Subject>,
        action: Action,
        city: Option<&str>,
        institution: Option<&str>,
    ) -> bool {
        let Some(subject) = subject else {
            tracing::debug!(%action, "Denied: unknown principal");
            return false;
        };

        if subject.principal.is_superuser {
            return true;
        }

        let allowed = subject
            .permissions
            .lookup(action, city, institution)
            .unwrap_or(false);

        tracing::trace!(
            principal = %subject.principal.id,
            %action,
            city = city.unwrap_or("-"),
            institution = institution.unwrap_or("-"),
            allowed,
            "Permission check"
        );
        allowed
    }

    /// Same as [`can_perform`](Self::can_perform) for an action given by name.
    pub fn can_perform_named(
        &self,
        subject: Option<&Subject>,
        action: &str,
        city: Option<&str>,
        institution: Option<&str>,
    ) -> Result<bool> {
        match Action::parse(action) {
            Some(action) => Ok(self.can_perform(subject, action, city, institution)),
            None if self.strict => Err(Error::UnknownAction(action.to_string())),
            None => {
                tracing::error!(action, "Unknown action name; denying");
                Ok(false)
            }
        }
    }

    /// Returns [`Error::PermissionDenied`] unless the action is allowed.
    pub fn authorize(
        &self,
        subject: Option<&Subject>,
        action: Action,
        city: Option<&str>,
        institution: Option<&str>,
    ) -> Result<()> {
        if self.can_perform(subject, action, city, institution) {
            return Ok(());
        }

        let target = match (city, institution) {
            (Some(c), Some(i)) => format!(" on {c}/{i}"),
            (Some(c), None) => format!(" on {c}"),
            _ => String::new(),
        };
        Err(Error::PermissionDenied(format!("{action}{target}")))
    }

    /// Keeps only the records the subject may view. Superusers and admins see all.
    #[must_use]
    pub fn visible_records(&self, subject: &Subject, records: Vec<RosterRecord>) -> Vec<RosterRecord> {
        if subject.principal.sees_everything() {
            return records;
        }
        records
            .into_iter()
            .filter(|r| {
                self.can_perform(
                    Some(subject),
                    Action::CanView,
                    Some(&r.city),
                    Some(&r.institution),
                )
            })
            .collect()
    }
}
