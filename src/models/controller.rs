use super::*;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuthLevel {
    Operator,
    Supervisor,
    Manager,
    Admin,
}

/// An authenticated principal allowed to issue decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Controller {
    pub id: ControllerId,
    pub employee_id: String,
    pub auth_level: AuthLevel,
    pub section_responsibility: Vec<SectionId>,
    pub active: bool,
    pub password_digest: String,
    pub created_at: DateTime<Utc>,
}

impl Controller {
    pub fn new(
        id: impl Into<ControllerId>,
        employee_id: impl Into<String>,
        auth_level: AuthLevel,
        password: &str,
    ) -> Self {
        Self {
            id: id.into(),
            employee_id: employee_id.into(),
            auth_level,
            section_responsibility: Vec::new(),
            active: true,
            password_digest: digest_password(password),
            created_at: Utc::now(),
        }
    }

    pub fn at_least(&self, level: AuthLevel) -> bool {
        self.auth_level >= level
    }

    /// Admins may control any train; everyone else only trains inside a
    /// section they are responsible for.
    pub fn responsible_for(&self, section_id: SectionId) -> bool {
        self.auth_level == AuthLevel::Admin || self.section_responsibility.contains(&section_id)
    }

    pub fn verify_password(&self, password: &str) -> bool {
        self.password_digest == digest_password(password)
    }
}

pub fn digest_password(password: &str) -> String {
    format!("{:x}", md5::compute(password.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_levels_are_ordered() {
        assert!(AuthLevel::Admin > AuthLevel::Manager);
        assert!(AuthLevel::Manager > AuthLevel::Supervisor);
        assert!(AuthLevel::Supervisor > AuthLevel::Operator);
    }

    #[test]
    fn supervisor_meets_supervisor_requirement() {
        let ctrl = Controller::new("CTR001", "EMP-7", AuthLevel::Supervisor, "secret");
        assert!(ctrl.at_least(AuthLevel::Supervisor));
        assert!(!ctrl.at_least(AuthLevel::Manager));
    }

    #[test]
    fn admin_is_responsible_everywhere() {
        let admin = Controller::new("ADM", "EMP-1", AuthLevel::Admin, "pw");
        assert!(admin.responsible_for(42));
        let mut op = Controller::new("OP", "EMP-2", AuthLevel::Operator, "pw");
        op.section_responsibility = vec![7];
        assert!(op.responsible_for(7));
        assert!(!op.responsible_for(42));
    }

    #[test]
    fn password_round_trip() {
        let ctrl = Controller::new("CTR001", "EMP-7", AuthLevel::Supervisor, "secret");
        assert!(ctrl.verify_password("secret"));
        assert!(!ctrl.verify_password("wrong"));
    }
}
