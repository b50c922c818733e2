//! Client order id generation.

use uuid::Uuid;

/// Generate a unique client order id with a kind prefix.
///
/// Format: `{prefix}_{uuid}` with the uuid in simple (hyphen-free) form.
/// The id doubles as the durable order key and the venue idempotency key.
pub fn generate_client_order_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().as_simple())
}
