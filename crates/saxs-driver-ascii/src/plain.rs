//! Exchanges shared by the plain-envelope drivers.

use saxs_core::protocol::line::{CommandTable, Reply};
use saxs_core::{with_retry, Connection, CoreError, CoreResult, PropertyCache, RetryPolicy};
use std::sync::Arc;

/// Capture holding a device refusal. Every command table lists a refusal
/// pattern so that an error line completes the exchange instead of timing out.
pub(crate) const REFUSAL: &str = "error";

/// Send `line` with a CR terminator and wait for the reply to `command`,
/// retrying communication failures. Refusals become
/// [`CoreError::DeviceRejected`].
pub(crate) async fn query(
    conn: &Connection,
    table: &Arc<CommandTable>,
    retry: &RetryPolicy,
    command: &str,
    line: &str,
) -> CoreResult<Reply> {
    let bytes = format!("{line}\r");
    let reply = with_retry(retry, command, |_| {
        conn.execute(bytes.as_bytes(), command, CommandTable::matcher(table, command))
    })
    .await?;
    match reply.text(REFUSAL) {
        Some(code) => Err(CoreError::rejected(
            conn.name(),
            format!("{command}: device refused with {code}"),
        )),
        None => Ok(reply),
    }
}

/// Store every field of `reply` whose name is a declared property.
pub(crate) fn publish(cache: &PropertyCache, reply: &Reply) {
    let declared = cache.names();
    for (field, value) in &reply.fields {
        if declared.iter().any(|n| n == field) {
            cache.store(field, value.clone());
        }
    }
}
