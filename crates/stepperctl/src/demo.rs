//! The demo step catalogue: connect, launch, attach, detach and disconnect
//! a [`SimulatedTarget`](crate::target::SimulatedTarget).

use std::sync::Arc;

use stepper::{
    CancelJobsStep, JobTracker, ListIterator, OperationEntry, Result, SchedulingRuleProvider, StaticOperationService,
    StepContext, StepDefinition, StepGroup, StepGroupable, StepRegistry,
};

use crate::steps::{
    AttachContextStep, CloseChannelStep, DetachContextStep, LaunchProcessStep, OpenChannelStep, ResumeProcessStep,
    SetConnectStateStep, WaitForReadyStep,
};

/// Iterator over the `processes` job key.
pub const PROCESS_ITERATOR: &str = "processes";

fn connect_state(id: &str, state: &str) -> StepDefinition {
    StepDefinition::new(id, SetConnectStateStep)
        .with_label(format!("Set connect state: {}", state))
        .with_parameter("state", state)
}

/// Register the demo steps, iterators and groups.
///
/// `tracker` must be the one the engine is built with so that `cancel-jobs`
/// sees the engine's jobs.
pub fn registry(tracker: Arc<JobTracker>) -> Result<StepRegistry> {
    let mut registry = StepRegistry::new();

    registry.register_step(
        connect_state("set-connecting", "connecting")
            .with_parameter("stateOnCancel", "disconnected")
            .with_parameter("stateOnError", "disconnected"),
    )?;
    registry.register_step(connect_state("set-connected", "connected"))?;
    registry.register_step(
        connect_state("set-disconnecting", "disconnecting")
            .with_parameter("stateOnCancel", "connected")
            .with_parameter("stateOnError", "connected"),
    )?;
    registry.register_step(connect_state("set-disconnected", "disconnected"))?;

    registry.register_step(StepDefinition::new("open-channel", OpenChannelStep).with_label("Open channel"))?;
    registry.register_step(
        StepDefinition::new("wait-for-ready", WaitForReadyStep)
            .with_label("Wait for target")
            .depends_on("open-channel"),
    )?;
    registry.register_step(StepDefinition::new("close-channel", CloseChannelStep).with_label("Close channel"))?;
    registry.register_step(
        StepDefinition::new("launch-process", LaunchProcessStep)
            .with_label("Launch processes")
            .with_total_work(200),
    )?;
    registry.register_step(StepDefinition::new("attach-context", AttachContextStep).with_label("Attach"))?;
    registry.register_step(StepDefinition::new("resume-process", ResumeProcessStep).with_label("Resume"))?;
    registry.register_step(StepDefinition::new("detach-context", DetachContextStep).with_label("Detach"))?;
    registry.register_step(
        StepDefinition::new("cancel-jobs", CancelJobsStep::new(tracker))
            .with_label("Cancel running jobs")
            .singleton(),
    )?;

    registry.register_iterator(PROCESS_ITERATOR, ListIterator::factory())?;

    registry.register_group(
        StepGroup::new("connect")
            .with_label("Connect")
            .with_child(StepGroupable::step("set-connecting"))
            .with_child(StepGroupable::step("wait-for-ready"))
            .with_child(StepGroupable::step("open-channel").depends_on("set-connecting"))
            .with_child(StepGroupable::step("set-connected").depends_on("wait-for-ready")),
    )?;
    registry.register_group(
        StepGroup::new("attach")
            .with_label("Attach")
            .iterated_by(PROCESS_ITERATOR)
            .with_parameter(ListIterator::SOURCE, "processes")
            .with_child(StepGroupable::step("attach-context")),
    )?;
    registry.register_group(
        StepGroup::new("detach")
            .with_label("Detach")
            .iterated_by(PROCESS_ITERATOR)
            .with_parameter(ListIterator::SOURCE, "processes")
            .with_child(StepGroupable::step("detach-context")),
    )?;
    registry.register_group(
        StepGroup::new("launch")
            .with_label("Launch")
            .locked()
            .with_child(StepGroupable::group("connect").enabled_when(|ctx| !is_connected(ctx)))
            .with_child(StepGroupable::step("launch-process"))
            .with_child(StepGroupable::group("attach").depends_on("launch-process"))
            .with_child(StepGroupable::step("resume-process").depends_on("attach")),
    )?;
    registry.register_group(
        StepGroup::new("disconnect")
            .with_label("Disconnect")
            .with_child(StepGroupable::step("cancel-jobs"))
            .with_child(StepGroupable::step("set-disconnecting").depends_on("cancel-jobs"))
            .with_child(StepGroupable::step("close-channel").depends_on("set-disconnecting"))
            .with_child(StepGroupable::step("set-disconnected").depends_on("close-channel")),
    )?;

    Ok(registry)
}

fn is_connected(context: &dyn StepContext) -> bool {
    context
        .as_any()
        .downcast_ref::<crate::target::SimulatedTarget>()
        .is_some_and(|t| t.connect_state() == crate::target::ConnectState::Connected)
}

/// Operation table for the demo groups.
pub fn service() -> StaticOperationService {
    StaticOperationService::new()
        .with_operation("connect", OperationEntry::new("connect").with_name("Connect").with_history())
        .with_operation(
            "disconnect",
            OperationEntry::new("disconnect")
                .with_name("Disconnect")
                .not_cancelable()
                .with_history(),
        )
        .with_operation(
            "launch",
            OperationEntry::new("launch")
                .with_name("Launch")
                .requires("processes")
                .with_history(),
        )
        .with_operation(
            "attach",
            OperationEntry::new("attach").with_name("Attach").requires("processes"),
        )
        .with_operation(
            "detach",
            OperationEntry::new("detach").with_name("Detach").requires("processes"),
        )
}

/// Jobs on a target run one at a time, except `disconnect`, which runs
/// beside them so that it can cancel them.
#[derive(Debug, Default)]
pub struct DemoRules;

impl SchedulingRuleProvider for DemoRules {
    fn rule_key(&self, context: &dyn StepContext, operation: &str) -> String {
        match operation {
            "disconnect" => format!("{}#disconnect", context.id()),
            _ => context.id().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use stepper::{ErrorKind, JobOutcome, PropertiesContainer, Stepper};

    use super::*;
    use crate::target::{ConnectState, ProcessState, SimulatedTarget};

    fn engine() -> Stepper {
        let tracker = Arc::new(JobTracker::new());
        Stepper::builder(registry(tracker.clone()).unwrap())
            .service(Arc::new(service()))
            .scheduling_rules(Arc::new(DemoRules))
            .tracker(tracker)
            .build()
    }

    fn target(fail_at: Option<&str>) -> Arc<SimulatedTarget> {
        Arc::new(
            SimulatedTarget::new("board")
                .with_latency(Duration::from_millis(1))
                .failing_at(fail_at.map(str::to_string)),
        )
    }

    fn with_processes(names: &[&str]) -> PropertiesContainer {
        let data = PropertiesContainer::new();
        data.set("processes", serde_json::json!(names));
        data
    }

    #[test]
    fn test_plan_orders_connect_by_dependencies() {
        let stepper = engine();
        let board = SimulatedTarget::new("board");
        let order: Vec<String> = stepper
            .plan(&board, "connect", &HashMap::new())
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            order,
            vec![
                "connect/set-connecting",
                "connect/open-channel",
                "connect/wait-for-ready",
                "connect/set-connected",
            ]
        );
    }

    #[test]
    fn test_plan_expands_attach_iterations() {
        let stepper = engine();
        let board = SimulatedTarget::new("board");
        let iterations = HashMap::from([("attach".to_string(), 2)]);
        let order: Vec<String> = stepper
            .plan(&board, "launch", &iterations)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(order[0], "launch/connect/set-connecting");
        assert!(order.contains(&"launch/attach[1]/attach-context".to_string()));
        assert_eq!(order.last().map(String::as_str), Some("launch/resume-process"));
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let stepper = engine();
        let board = target(None);
        let job = stepper.run(board.clone(), "connect", PropertiesContainer::new()).unwrap();
        assert_eq!(job.wait().await, JobOutcome::Succeeded);
        assert_eq!(board.connect_state(), ConnectState::Connected);
        assert!(board.is_channel_open());
    }

    #[tokio::test]
    async fn test_connect_failure_restores_disconnected() {
        let stepper = engine();
        let board = target(Some("wait-for-ready"));
        let outcome = stepper
            .run(board.clone(), "connect", PropertiesContainer::new())
            .unwrap()
            .wait()
            .await;
        assert!(outcome.message().unwrap().contains("simulated failure"));
        assert_eq!(board.connect_state(), ConnectState::Disconnected);
        assert!(!board.is_channel_open());
    }

    #[tokio::test]
    async fn test_launch_runs_every_process() {
        let stepper = engine();
        let board = target(None);
        let outcome = stepper
            .run(board.clone(), "launch", with_processes(&["p1", "p2"]))
            .unwrap()
            .wait()
            .await;
        assert!(outcome.is_success(), "{outcome}");
        assert_eq!(board.process("p1"), Some(ProcessState::Running));
        assert_eq!(board.process("p2"), Some(ProcessState::Running));
    }

    #[tokio::test]
    async fn test_failed_attach_terminates_launched_processes() {
        let stepper = engine();
        let board = target(Some("attach-context"));
        let outcome = stepper
            .run(board.clone(), "launch", with_processes(&["p1"]))
            .unwrap()
            .wait()
            .await;
        assert!(!outcome.is_success());
        assert!(board.process_names().is_empty());
        assert_eq!(board.connect_state(), ConnectState::Disconnected);
    }

    #[tokio::test]
    async fn test_launch_requires_processes() {
        let stepper = engine();
        let err = stepper
            .run(target(None), "launch", PropertiesContainer::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_running_launch() {
        let stepper = engine();
        let board = Arc::new(SimulatedTarget::new("board").with_latency(Duration::from_millis(200)));
        let launch = stepper
            .run(board.clone(), "launch", with_processes(&["p1"]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let disconnect = stepper
            .run(board.clone(), "disconnect", PropertiesContainer::new())
            .unwrap();
        assert!(disconnect.wait().await.is_success());
        assert!(launch.outcome().unwrap().is_cancelled());
        assert_eq!(board.connect_state(), ConnectState::Disconnected);
        assert!(!board.is_channel_open());
    }
}
