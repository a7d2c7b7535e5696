use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEventKind, InterruptEvent, PlanEvent};
use crate::orchestrator::Orchestrator;
use conductor_store::{
    ExecutableResponse, FailureInfo, FailureType, Interrupt, InterruptEffect, InterruptState,
    InterruptStore, InterruptType, NodeExecution, NodeExecutionOp, NodeExecutionStore,
    PlanExecutionStore, Status, now_ms,
};
use std::collections::BTreeMap;
use tracing::{Instrument, debug, info, info_span, warn};

enum Disposition {
    Processed,
    Rejected(String),
    /// Closed later by whoever observes the interrupt's effect.
    KeepOpen,
}

fn rejected(reason: impl Into<String>) -> EngineResult<Disposition> {
    Ok(Disposition::Rejected(reason.into()))
}

impl Orchestrator {
    /// Validates, persists and applies an interrupt. Returns it in its state
    /// after processing.
    pub async fn register_interrupt(
        &self,
        interrupt_type: InterruptType,
        plan_execution_id: &str,
        node_execution_id: Option<&str>,
        issued_by: Option<&str>,
        metadata: BTreeMap<String, String>,
    ) -> EngineResult<Interrupt> {
        match (interrupt_type.is_plan_level(), node_execution_id) {
            (true, Some(_)) => {
                return Err(EngineError::InvalidInterrupt(format!(
                    "{} applies to a whole plan and takes no node execution id",
                    interrupt_type.as_str()
                )));
            }
            (false, None) => {
                return Err(EngineError::InvalidInterrupt(format!(
                    "{} requires a node execution id",
                    interrupt_type.as_str()
                )));
            }
            _ => {}
        }
        let store = &self.inner.store;
        store.get_plan_execution(plan_execution_id).await?;
        if let Some(node_execution_id) = node_execution_id {
            let node = store.get_node_execution(node_execution_id).await?;
            if node.plan_execution_id != plan_execution_id {
                return Err(EngineError::InvalidInterrupt(format!(
                    "node execution '{node_execution_id}' does not belong to plan execution '{plan_execution_id}'"
                )));
            }
        }

        let now = now_ms();
        let interrupt = store
            .save_interrupt(Interrupt {
                uuid: uuid::Uuid::new_v4().to_string(),
                interrupt_type,
                plan_execution_id: plan_execution_id.to_string(),
                node_execution_id: node_execution_id.map(str::to_string),
                state: InterruptState::Registered,
                created_at: now,
                last_updated_at: now,
                issued_by: issued_by.map(str::to_string),
                metadata,
            })
            .await?;
        info!(
            plan_execution_id = %plan_execution_id,
            interrupt_id = %interrupt.uuid,
            interrupt_type = interrupt_type.as_str(),
            "interrupt registered"
        );
        self.inner
            .events
            .emit(EngineEventKind::Interrupt(InterruptEvent::Registered {
                plan_execution_id: plan_execution_id.to_string(),
                interrupt_id: interrupt.uuid.clone(),
                interrupt_type,
            }));
        self.apply_interrupt(&interrupt.uuid).await
    }

    /// Claims and processes a registered interrupt.
    pub async fn apply_interrupt(&self, interrupt_id: &str) -> EngineResult<Interrupt> {
        let store = &self.inner.store;
        let Some(interrupt) = store
            .update_interrupt_state(
                interrupt_id,
                &[InterruptState::Registered],
                InterruptState::Processing,
            )
            .await?
        else {
            debug!(interrupt_id = %interrupt_id, "interrupt already claimed");
            return Ok(store.get_interrupt(interrupt_id).await?);
        };

        let span = info_span!(
            "interrupt",
            interrupt_id = %interrupt.uuid,
            interrupt_type = interrupt.interrupt_type.as_str(),
            plan_execution_id = %interrupt.plan_execution_id,
        );
        let disposition = self.process_interrupt(&interrupt).instrument(span).await;
        let closer = self.inner.dispatcher.closer();
        match disposition {
            Ok(Disposition::Processed) => {
                closer
                    .close(interrupt_id, InterruptState::ProcessedSuccessfully)
                    .await?;
            }
            Ok(Disposition::Rejected(reason)) => {
                info!(interrupt_id = %interrupt_id, reason = %reason, "interrupt had no effect");
                closer
                    .close(interrupt_id, InterruptState::ProcessedUnsuccessfully)
                    .await?;
            }
            Ok(Disposition::KeepOpen) => {}
            Err(error) => {
                warn!(interrupt_id = %interrupt_id, error = %error, "interrupt processing failed");
                closer
                    .close(interrupt_id, InterruptState::ProcessedUnsuccessfully)
                    .await?;
            }
        }
        Ok(store.get_interrupt(interrupt_id).await?)
    }

    async fn process_interrupt(&self, interrupt: &Interrupt) -> EngineResult<Disposition> {
        let effect = InterruptEffect {
            interrupt_id: interrupt.uuid.clone(),
            interrupt_type: interrupt.interrupt_type,
            took_effect_at: now_ms(),
        };
        let plan_execution_id = interrupt.plan_execution_id.as_str();
        match interrupt.interrupt_type {
            InterruptType::AbortAll => return self.abort_all(plan_execution_id, effect).await,
            InterruptType::PauseAll => return self.pause_all(plan_execution_id).await,
            InterruptType::ResumeAll => return self.resume_all(plan_execution_id, effect).await,
            _ => {}
        }

        let node_execution_id = interrupt.node_execution_id.as_deref().ok_or_else(|| {
            EngineError::InvalidInterrupt(format!(
                "{} requires a node execution id",
                interrupt.interrupt_type.as_str()
            ))
        })?;
        let node = self.inner.store.get_node_execution(node_execution_id).await?;
        if node.old_retry {
            return rejected("node was superseded by a retry");
        }
        match interrupt.interrupt_type {
            InterruptType::Abort => self.abort_target(node, effect).await,
            InterruptType::Pause => self.pause_node(node, effect).await,
            InterruptType::Resume => self.resume_node(node, effect).await,
            InterruptType::Retry => self.retry_target(node, effect).await,
            InterruptType::MarkFailed => self.mark_failed(node, effect).await,
            InterruptType::MarkSuccess => {
                self.force_final(node, Status::Succeeded, effect, NodeExecutionOp::ClearFailureInfo)
                    .await
            }
            InterruptType::Ignore => {
                self.force_final(node, Status::Ignored, effect, NodeExecutionOp::ClearFailureInfo)
                    .await
            }
            InterruptType::MarkExpired => {
                let info = FailureInfo::new("node exceeded its timeout", FailureType::Timeout);
                let op = NodeExecutionOp::SetFailureInfo(info);
                self.force_final(node, Status::Expired, effect, op).await
            }
            InterruptType::AbortAll | InterruptType::PauseAll | InterruptType::ResumeAll => {
                Err(EngineError::InvalidInterrupt(format!(
                    "{} applies to a whole plan",
                    interrupt.interrupt_type.as_str()
                )))
            }
        }
    }

    async fn abort_all(
        &self,
        plan_execution_id: &str,
        effect: InterruptEffect,
    ) -> EngineResult<Disposition> {
        let mut nodes = self
            .inner
            .store
            .find_by_status_in(plan_execution_id, &Status::non_final())
            .await?;
        nodes.sort_by_key(|node| std::cmp::Reverse(node.ambiance.depth()));
        let mut aborted = 0;
        for node in &nodes {
            if self.abort_node(node, Some(effect.clone())).await?.is_some() {
                aborted += 1;
            }
        }
        let finished = self.finish_plan(plan_execution_id, Status::Aborted).await?;
        debug!(aborted, "plan aborted");
        if finished || aborted > 0 {
            Ok(Disposition::Processed)
        } else {
            rejected("plan already finished")
        }
    }

    async fn pause_all(&self, plan_execution_id: &str) -> EngineResult<Disposition> {
        let paused = self
            .inner
            .store
            .update_plan_status(plan_execution_id, &[Status::Running], Status::Paused)
            .await?;
        if paused.is_none() {
            return rejected("plan is not running");
        }
        info!(plan_execution_id = %plan_execution_id, "plan paused");
        self.inner
            .events
            .emit(EngineEventKind::Plan(PlanEvent::Paused {
                plan_execution_id: plan_execution_id.to_string(),
            }));
        // Stays PROCESSING while in force; RESUME_ALL closes it.
        Ok(Disposition::KeepOpen)
    }

    async fn resume_all(
        &self,
        plan_execution_id: &str,
        effect: InterruptEffect,
    ) -> EngineResult<Disposition> {
        let store = &self.inner.store;
        let closer = self.inner.dispatcher.closer();
        let mut closed = 0;
        for pause in store.fetch_active_interrupts(plan_execution_id).await? {
            if pause.interrupt_type == InterruptType::PauseAll
                && closer
                    .close(&pause.uuid, InterruptState::ProcessedSuccessfully)
                    .await?
            {
                closed += 1;
            }
        }
        let resumed = store
            .update_plan_status(plan_execution_id, &[Status::Paused], Status::Running)
            .await?;
        if resumed.is_some() {
            info!(plan_execution_id = %plan_execution_id, "plan resumed");
            self.inner
                .events
                .emit(EngineEventKind::Plan(PlanEvent::Resumed {
                    plan_execution_id: plan_execution_id.to_string(),
                }));
        }
        let mut nodes = 0;
        for node in store
            .find_by_status_in(plan_execution_id, &[Status::Paused])
            .await?
        {
            if self.resume_paused(node, effect.clone()).await? {
                nodes += 1;
            }
        }
        if resumed.is_some() || closed > 0 || nodes > 0 {
            Ok(Disposition::Processed)
        } else {
            rejected("plan is not paused")
        }
    }

    async fn abort_target(
        &self,
        node: NodeExecution,
        effect: InterruptEffect,
    ) -> EngineResult<Disposition> {
        if node.status.is_final() {
            return rejected(format!("node already {}", node.status));
        }
        self.abort_descendants(&node.uuid, &effect).await?;
        match self.abort_node(&node, Some(effect)).await? {
            Some(aborted) => {
                self.end_transition(&aborted).await?;
                Ok(Disposition::Processed)
            }
            None => rejected("node finished concurrently"),
        }
    }

    async fn pause_node(
        &self,
        node: NodeExecution,
        effect: InterruptEffect,
    ) -> EngineResult<Disposition> {
        let pausable = match node.status {
            Status::Queued
            | Status::AsyncWaiting
            | Status::TaskWaiting
            | Status::ApprovalWaiting => true,
            // Parents sit RUNNING while their children work.
            Status::Running => node.mode.is_some_and(|mode| !mode.is_leaf()),
            _ => false,
        };
        if !pausable {
            return rejected(format!("node in {} cannot be paused", node.status));
        }
        match self
            .inner
            .store
            .update_node_status_with_ops(
                &node.uuid,
                &[node.status],
                Status::Paused,
                vec![NodeExecutionOp::AddInterruptHistory(effect)],
            )
            .await?
        {
            Some(paused) => {
                self.dispatch(&paused).await;
                Ok(Disposition::Processed)
            }
            None => rejected("node changed status concurrently"),
        }
    }

    async fn resume_node(
        &self,
        node: NodeExecution,
        effect: InterruptEffect,
    ) -> EngineResult<Disposition> {
        if node.status != Status::Paused {
            return rejected(format!("node in {} is not paused", node.status));
        }
        if self.resume_paused(node, effect).await? {
            Ok(Disposition::Processed)
        } else {
            rejected("node changed status concurrently")
        }
    }

    /// Puts a paused node back where it was and redelivers any responses that
    /// completed its wait while it was paused.
    async fn resume_paused(
        &self,
        node: NodeExecution,
        effect: InterruptEffect,
    ) -> EngineResult<bool> {
        let store = &self.inner.store;
        let history = vec![NodeExecutionOp::AddInterruptHistory(effect)];
        if node.start_ts.is_none() {
            let Some(queued) = store
                .update_node_status_with_ops(&node.uuid, &[Status::Paused], Status::Queued, history)
                .await?
            else {
                return Ok(false);
            };
            self.dispatch(&queued).await;
            self.spawn_activation(&queued);
            return Ok(true);
        }

        let restored = match node.latest_executable_response() {
            Some(ExecutableResponse::Async { status, .. }) => *status,
            Some(ExecutableResponse::Task { .. }) => Status::TaskWaiting,
            _ => Status::Running,
        };
        let Some(resumed) = store
            .update_node_status_with_ops(&node.uuid, &[Status::Paused], restored, history)
            .await?
        else {
            return Ok(false);
        };
        self.dispatch(&resumed).await;
        for wait in self
            .inner
            .notifier
            .ready_waits(&resumed.plan_execution_id)
            .await?
        {
            if wait.node_execution_id == resumed.uuid {
                self.spawn_resume(wait);
            }
        }
        Ok(true)
    }

    async fn retry_target(
        &self,
        node: NodeExecution,
        effect: InterruptEffect,
    ) -> EngineResult<Disposition> {
        if node.status != Status::InterventionWaiting {
            return rejected(format!("node in {} is not awaiting intervention", node.status));
        }
        let plan = self.inner.plans.plan_for(&node.plan_execution_id).await?;
        match self.retry_node(&node, &plan, Some(effect), 0).await? {
            // The new attempt's terminal handler closes the interrupt.
            Some(_) => Ok(Disposition::KeepOpen),
            None => rejected("node changed status concurrently"),
        }
    }

    /// Forces `FAILED` without consulting advisers and reports to the parent.
    async fn mark_failed(
        &self,
        node: NodeExecution,
        effect: InterruptEffect,
    ) -> EngineResult<Disposition> {
        if node.status.is_final() {
            return rejected(format!("node already {}", node.status));
        }
        self.abort_descendants(&node.uuid, &effect).await?;
        self.abort_work(&node).await;
        let info = FailureInfo::new(
            format!("marked failed by interrupt {}", effect.interrupt_id),
            FailureType::Application,
        );
        let Some(failed) = self
            .inner
            .store
            .update_node_status_with_ops(
                &node.uuid,
                &Status::non_final(),
                Status::Failed,
                vec![
                    NodeExecutionOp::AddInterruptHistory(effect),
                    NodeExecutionOp::SetFailureInfo(info),
                ],
            )
            .await?
        else {
            return rejected("node finished concurrently");
        };
        self.disarm_timeout(&failed.uuid);
        self.dispatch(&failed).await;
        self.end_transition(&failed).await?;
        Ok(Disposition::Processed)
    }

    /// Forces a final status and runs advisers as if the step had produced it.
    async fn force_final(
        &self,
        node: NodeExecution,
        status: Status,
        effect: InterruptEffect,
        failure_op: NodeExecutionOp,
    ) -> EngineResult<Disposition> {
        if node.status.is_final() {
            return rejected(format!("node already {}", node.status));
        }
        self.abort_descendants(&node.uuid, &effect).await?;
        self.abort_work(&node).await;
        let Some(forced) = self
            .inner
            .store
            .update_node_status_with_ops(
                &node.uuid,
                &Status::non_final(),
                status,
                vec![NodeExecutionOp::AddInterruptHistory(effect), failure_op],
            )
            .await?
        else {
            return rejected("node finished concurrently");
        };
        self.after_final(forced).await?;
        Ok(Disposition::Processed)
    }
}
