use async_trait::async_trait;
use tracing::info;

use super::context::UpdateContext;
use super::progress::Progress;
use crate::error::Result;

/// One phase of a client run.
#[async_trait]
pub trait UpdateStep: Send {
    fn name(&self) -> &str;

    /// Units this step reports to [`Progress`] when performed against `ctx`.
    fn unit_count(&self, ctx: &UpdateContext) -> u64;

    async fn perform(&mut self, ctx: &UpdateContext, progress: &Progress) -> Result<()>;
}

pub type StepCallback = dyn Fn(&str) + Send + Sync;

/// Runs registered steps in order against one context.
#[derive(Default)]
pub struct UpdateRunner {
    steps: Vec<Box<dyn UpdateStep>>,
    on_step_performed: Option<Box<StepCallback>>,
}

impl UpdateRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step: impl UpdateStep + 'static) -> &mut Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn on_step_performed(&mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> &mut Self {
        self.on_step_performed = Some(Box::new(callback));
        self
    }

    pub fn total_units(&self, ctx: &UpdateContext) -> u64 {
        self.steps.iter().map(|s| s.unit_count(ctx)).sum()
    }

    pub async fn run(&mut self, ctx: &UpdateContext, progress: &Progress) -> Result<()> {
        let total = self.total_units(ctx);
        progress.set_total(total);
        info!(steps = self.steps.len(), units = total, "Running update steps");

        for step in &mut self.steps {
            info!(step = step.name(), "Step started");
            step.perform(ctx, progress).await?;
            if let Some(callback) = &self.on_step_performed {
                callback(step.name());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fixture::Workspace;
    use crate::client::{Repairer, Updater};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_runs_steps_in_order_with_fixed_total() {
        let workspace = Workspace::new();
        workspace.publish("1.0.0", &[("a.txt", b"first")]).await;
        workspace
            .publish("1.1.0", &[("a.txt", b"second"), ("b.txt", b"added")])
            .await;
        workspace.patch("1.0.0", "1.1.0").await;

        let client = workspace.client();
        client.install("1.0.0");
        let ctx = client.context().await;

        let performed = Arc::new(Mutex::new(Vec::new()));
        let seen = performed.clone();
        let mut runner = UpdateRunner::new();
        runner
            .register(Repairer::new())
            .register(Updater::new())
            .on_step_performed(move |name| seen.lock().unwrap().push(name.to_string()));

        // Two build entries checked, three patch entries applied.
        assert_eq!(runner.total_units(&ctx), 2 + 3);
        let progress = Progress::new();
        runner.run(&ctx, &progress).await.unwrap();

        assert_eq!(*performed.lock().unwrap(), ["repair", "update"]);
        assert_eq!(progress.total(), 5);
        assert_eq!(progress.current(), 5);
        client.assert_matches_build("1.1.0");
    }
}
