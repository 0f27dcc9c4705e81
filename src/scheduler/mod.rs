//! Background schedule runner.
//!
//! A single loop wakes every 30 seconds, asks the store for due schedules,
//! and fires each one through the same spawn path as an interactive
//! invocation. A schedule is advanced (`mark_schedule_run`) whether or not
//! its launch succeeded, so a permanently failing schedule cannot wedge the
//! due-queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::agents::orchestrator::DEFAULT_MAX_ITERATIONS;
use crate::event_bus::AppEvent;
use crate::runtime::AppContext;

/// How often the runner scans for due schedules.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

pub struct ScheduleRunner {
    ctx: Arc<AppContext>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl ScheduleRunner {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            ctx,
            stop_tx,
            stop_rx,
        }
    }

    /// Start the background loop. Callers hold a single runner instance;
    /// `stop` ends the loop.
    pub fn start(&self) {
        let ctx = self.ctx.clone();
        let mut stop_rx = self.stop_rx.clone();

        tokio::spawn(async move {
            log::info!("schedule runner started (tick {}s)", TICK_INTERVAL.as_secs());
            let mut ticker = tokio::time::interval(TICK_INTERVAL);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let fired = run_due_schedules(&ctx, Utc::now()).await;
                        if fired > 0 {
                            log::info!("schedule runner: fired {fired} schedule(s)");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("schedule runner stopped");
        });
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// One scan at instant `now`: fire every due schedule, advancing each
/// regardless of launch outcome. Returns the number of schedules processed.
pub async fn run_due_schedules(ctx: &Arc<AppContext>, now: DateTime<Utc>) -> usize {
    let due = match ctx.store.due_schedules(now) {
        Ok(due) => due,
        Err(e) => {
            log::error!("schedule runner: failed to query due schedules: {e}");
            return 0;
        }
    };

    let mut fired = 0;
    for schedule in due {
        let run_id = match ctx.spawn_agent_run(
            &schedule.project_dir,
            &schedule.agent_name,
            &schedule.message,
            DEFAULT_MAX_ITERATIONS,
        ) {
            Ok(handle) => {
                log::info!(
                    "schedule '{}' triggered agent '{}' (run {})",
                    schedule.name,
                    schedule.agent_name,
                    handle.run_id
                );
                Some(handle.run_id)
            }
            Err(e) => {
                log::error!("schedule '{}' failed to launch: {e}", schedule.name);
                let _ = ctx.bus.publish(AppEvent::SystemError {
                    message: format!("schedule '{}' failed to launch: {e}", schedule.name),
                });
                None
            }
        };

        let _ = ctx.bus.publish(AppEvent::ScheduleFired {
            schedule_id: schedule.schedule_id.clone(),
            schedule_name: schedule.name.clone(),
            run_id,
        });

        // Advance in both arms so the schedule cannot stall the queue.
        if let Err(e) = ctx.store.mark_schedule_run(&schedule.schedule_id, now) {
            log::error!("schedule '{}': failed to mark run: {e}", schedule.name);
        }
        fired += 1;
    }
    fired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::{LLMClient, Result as LlmResult, TokenStream};
    use crate::ai::types::CompletionRequest;
    use crate::runtime::AppConfig;
    use crate::store::models::IntervalKind;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    struct CannedLlm;

    #[async_trait]
    impl LLMClient for CannedLlm {
        async fn stream_completion(&self, _request: CompletionRequest) -> LlmResult<TokenStream> {
            let content = r#"<tool_call>
<tool_name>end_session</tool_name>
<parameters>{"final_message": "scheduled work done"}</parameters>
</tool_call>"#
                .to_string();
            Ok(Box::pin(futures::stream::iter(vec![Ok(content)])) as TokenStream)
        }

        fn client_name(&self) -> &str {
            "canned"
        }
    }

    fn make_context(tmp: &tempfile::TempDir) -> Arc<AppContext> {
        let config = AppConfig {
            db_path: tmp.path().join("sched.db"),
            user_dir: tmp.path().join("user"),
            logs_dir: tmp.path().join("logs"),
            model: "test-model".to_string(),
            tool_pool_size: 2,
        };
        AppContext::new(config, Arc::new(CannedLlm)).unwrap()
    }

    #[tokio::test]
    async fn due_schedule_fires_and_advances() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = make_context(&tmp);

        let agent_dir = ctx.projects.agents_dir("default").join("cron_agent");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(agent_dir.join("description.txt"), "scheduled").unwrap();
        std::fs::write(agent_dir.join("system_prompt.txt"), "You run on a schedule.").unwrap();
        std::fs::write(agent_dir.join("tools.txt"), "").unwrap();

        let schedule = ctx
            .store
            .create_schedule(
                "ticker",
                "default",
                "cron_agent",
                "do the rounds",
                IntervalKind::Minutes,
                5,
                None,
                true,
            )
            .unwrap();

        // Evaluate a scan past the first due instant.
        let fire_time = Utc::now() + ChronoDuration::minutes(6);
        let fired = run_due_schedules(&ctx, fire_time).await;
        assert_eq!(fired, 1);

        let updated = ctx.store.schedule(&schedule.schedule_id).unwrap().unwrap();
        assert_eq!(updated.last_run_at, Some(fire_time));
        assert_eq!(updated.next_run_at, fire_time + ChronoDuration::minutes(5));

        // The launched run exists in the tree.
        let runs = ctx.store.runs(Some("default")).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].agent_name, "cron_agent");
    }

    #[tokio::test]
    async fn failing_schedule_still_advances() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = make_context(&tmp);

        // No such agent exists: the launch fails every time.
        let schedule = ctx
            .store
            .create_schedule(
                "broken",
                "default",
                "missing_agent",
                "",
                IntervalKind::Minutes,
                5,
                None,
                true,
            )
            .unwrap();

        let fire_time = Utc::now() + ChronoDuration::minutes(6);
        let fired = run_due_schedules(&ctx, fire_time).await;
        assert_eq!(fired, 1);

        let updated = ctx.store.schedule(&schedule.schedule_id).unwrap().unwrap();
        assert_eq!(
            updated.next_run_at,
            fire_time + ChronoDuration::minutes(5),
            "a failing schedule must still be advanced"
        );
    }

    #[tokio::test]
    async fn nothing_due_means_no_fires() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = make_context(&tmp);
        ctx.store
            .create_schedule("future", "default", "a", "", IntervalKind::Weeks, 1, None, true)
            .unwrap();

        assert_eq!(run_due_schedules(&ctx, Utc::now()).await, 0);
    }
}
