//! Identifier generation for requests, jobs, and cache entries

use uuid::Uuid;

/// Generate a new request identifier
pub fn request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

/// Generate a new job identifier
pub fn job_id() -> String {
    format!("job-{}", Uuid::new_v4())
}

/// Generate an opaque subscriber identifier
pub fn subscriber_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(request_id(), request_id());
        assert_ne!(job_id(), job_id());
    }

    #[test]
    fn test_id_prefixes() {
        assert!(request_id().starts_with("req-"));
        assert!(job_id().starts_with("job-"));
    }
}
