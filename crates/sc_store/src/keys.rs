//! Keyspace layout helpers. Kept in one place so key formats never drift
//! between writers and scanners.

pub fn identity(user_id: &str) -> String {
    format!("identities/{user_id}")
}

pub fn session(local_user_id: &str, remote_user_id: &str) -> String {
    format!("sessions/{local_user_id}/{remote_user_id}")
}

pub fn session_prefix(local_user_id: &str) -> String {
    format!("sessions/{local_user_id}/")
}

pub fn contact(user_id: &str) -> String {
    format!("contacts/{user_id}")
}

pub const CONTACT_PREFIX: &str = "contacts/";
