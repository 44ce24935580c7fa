use async_trait::async_trait;

/// Fire-and-forget human notification seam.
///
/// Delivery failure never blocks governance state; callers log and move on.
/// Implementations that need credentials report readiness through
/// `is_configured` so an unconfigured channel yields a typed no-op instead of
/// an error path.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn notify(
        &self,
        recipient: &str,
        target_id: &str,
        summary: &str,
    ) -> anyhow::Result<()>;
}

/// Logs the notification instead of delivering it. Default channel when no
/// transport is wired up.
pub struct LogNotifier;

#[async_trait]
impl NotificationChannel for LogNotifier {
    fn is_configured(&self) -> bool {
        false
    }

    async fn notify(
        &self,
        recipient: &str,
        target_id: &str,
        summary: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(
            recipient = %recipient,
            target = %target_id,
            summary = %summary,
            "notification requested (no transport configured)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_notifier_reports_unconfigured_and_never_fails() {
        let notifier = LogNotifier;
        assert!(!notifier.is_configured());
        notifier
            .notify("reviewer@example.com", "dec-1", "needs review")
            .await
            .unwrap();
    }
}
