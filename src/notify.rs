use chrono::Local;
use rusqlite::Connection;
use uuid::Uuid;

use crate::store::TIMESTAMP_FORMAT;

/// Assignment notifications are fire-and-forget: a delivery failure must
/// never roll back the commit that triggered it.
pub trait Notifier {
    fn notify(&mut self, teacher_id: &str, title: &str, message: &str, priority: i64);
}

/// Production sink: appends to the notifications outbox table, which the
/// host shell polls and relays. Errors go to stderr and are dropped.
pub struct OutboxNotifier<'a> {
    pub conn: &'a Connection,
}

impl Notifier for OutboxNotifier<'_> {
    fn notify(&mut self, teacher_id: &str, title: &str, message: &str, priority: i64) {
        let result = self.conn.execute(
            "INSERT INTO notifications(id, teacher_id, title, message, priority, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                teacher_id,
                title,
                message,
                priority,
                Local::now().naive_local().format(TIMESTAMP_FORMAT).to_string(),
            ),
        );
        if let Err(e) = result {
            eprintln!("notification for {} dropped: {}", teacher_id, e);
        }
    }
}
