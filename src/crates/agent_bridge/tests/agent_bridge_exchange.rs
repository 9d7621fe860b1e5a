use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sim_agent_bridge::{
    AgentConnection, AgentEndpoint, AgentResponse, AgentWaitStep, BridgeError, Branch,
    ConnectionConfig, MemoryHost, Phase, SimulationElement, SimulationStep, StepConfig,
};

fn loopback() -> ConnectionConfig {
    ConnectionConfig::new(0).with_host("127.0.0.1")
}

fn host_with(episode: f64, observations: &[(&str, f64)]) -> MemoryHost {
    let mut host = MemoryHost::new()
        .with_state("Status", 0.0)
        .with_state("EpisodeNumber", episode)
        .with_state("Reward", 0.0)
        .with_state("Action", -1.0);
    for (name, value) in observations {
        host.set(*name, *value);
    }
    host
}

#[test]
fn runs_an_episode_of_sequential_decisions() {
    let connection = Arc::new(AgentConnection::new(loopback()));
    let step = AgentWaitStep::new(
        connection.clone(),
        StepConfig::new()
            .with_states(["Queue", "Busy"])
            .with_timeout(Duration::from_secs(2)),
    )
    .expect("bindings should be valid");

    connection.initialize().expect("channel should bind");
    let addr = connection.local_addr().expect("run should be active");

    let agent = thread::spawn(move || {
        let mut endpoint = AgentEndpoint::connect(addr, Duration::from_secs(2)).unwrap();
        let mut seen = Vec::new();
        endpoint
            .serve(|request| {
                seen.push(request.clone());
                if request.states[0] > 2.0 {
                    AgentResponse::act(request.states[0] - 1.0)
                } else {
                    AgentResponse::no_op(0.0)
                }
            })
            .unwrap();
        seen
    });

    let mut host = host_with(4.0, &[("Queue", 5.0), ("Busy", 1.0)]);
    let mut branches = Vec::new();
    for tick in 0..4 {
        host.set("Reward", f64::from(tick));
        let outcome = step.execute(&mut host);
        branches.push(outcome.branch().expect("exchange should complete"));
        let action = host.get("Action").unwrap();
        host.set("Queue", action.max(0.0));
    }

    connection.shutdown();
    let seen = agent.join().unwrap();

    assert_eq!(
        branches,
        [Branch::First, Branch::First, Branch::First, Branch::Alternate]
    );
    let queues: Vec<f64> = seen.iter().map(|request| request.states[0]).collect();
    assert_eq!(queues, [5.0, 4.0, 3.0, 2.0]);
    let rewards: Vec<f64> = seen.iter().map(|request| request.reward).collect();
    assert_eq!(rewards, [0.0, 1.0, 2.0, 3.0]);
    assert!(seen.iter().all(|request| request.episode_number == 4.0));
    assert!(host.errors().is_empty());
    assert_eq!(host.traces().len(), 4);
}

#[test]
fn send_timeout_is_reported_once_and_run_continues() {
    let connection = Arc::new(AgentConnection::new(loopback()));
    let step = AgentWaitStep::new(
        connection.clone(),
        StepConfig::new().with_timeout(Duration::from_millis(80)),
    )
    .unwrap();
    let _run = connection.start_run().unwrap();

    let mut host = host_with(1.0, &[]);
    let outcome = step.execute(&mut host);

    let failure = outcome.failure().expect("no agent is connected");
    assert_eq!(failure.phase, Phase::Sending);
    assert!(matches!(failure.error, BridgeError::SendTimeout(_)));
    assert_eq!(host.errors().len(), 1);
    assert_eq!(host.get("Action"), Some(-1.0));
    assert!(connection.is_running(), "a failed exchange must not end the run");
}

#[test]
fn receive_timeout_leaves_action_and_accepts_a_fresh_agent() {
    let connection = Arc::new(AgentConnection::new(loopback()));
    let step = AgentWaitStep::new(
        connection.clone(),
        StepConfig::new()
            .with_send_timeout(Duration::from_secs(2))
            .with_receive_timeout(Duration::from_millis(300)),
    )
    .unwrap();
    let run = connection.start_run().unwrap();
    let addr = run.local_addr();

    let agent = thread::spawn(move || {
        let mut sulky = AgentEndpoint::connect(addr, Duration::from_secs(2)).unwrap();
        sulky.recv_raw(None).unwrap();
        let hung_up = sulky.wait_for_hangup(Duration::from_secs(5)).unwrap();

        let mut fresh = AgentEndpoint::connect(addr, Duration::from_secs(2)).unwrap();
        let answered = fresh.serve(|_| AgentResponse::act(7.0)).unwrap();
        (hung_up, answered)
    });

    let mut host = host_with(1.0, &[]);
    let first = step.execute(&mut host);
    let failure = first.failure().expect("agent never answers");
    assert_eq!(failure.phase, Phase::AwaitingResponse);
    assert!(matches!(failure.error, BridgeError::ReceiveTimeout(_)));
    assert_eq!(host.errors().len(), 1);
    assert_eq!(host.get("Action"), Some(-1.0));

    // The host decides to try again at the next decision point.
    let second = step.execute(&mut host);
    assert_eq!(second.branch(), Some(Branch::First));
    assert_eq!(host.get("Action"), Some(7.0));

    drop(run);
    let (hung_up, answered) = agent.join().unwrap();
    assert!(hung_up, "bridge should drop the agent that missed its reply");
    assert_eq!(answered, 1);
}

#[test]
fn unbounded_timeouts_are_accepted() {
    let connection = Arc::new(AgentConnection::new(loopback()));
    let step = AgentWaitStep::new(
        connection.clone(),
        StepConfig::new().with_timeout(Duration::MAX),
    )
    .expect("an unbounded wait is a valid configuration");
    let run = connection.start_run().unwrap();
    let addr = run.local_addr();

    let agent = thread::spawn(move || {
        let mut endpoint = AgentEndpoint::connect(addr, Duration::from_secs(2)).unwrap();
        endpoint.serve(|_| AgentResponse::act(4.0)).unwrap()
    });

    let mut host = host_with(1.0, &[]);
    let outcome = step.execute(&mut host);
    assert_eq!(outcome.branch(), Some(Branch::First));
    assert_eq!(host.get("Action"), Some(4.0));
    assert!(host.errors().is_empty());

    drop(run);
    assert_eq!(agent.join().unwrap(), 1);
}

#[test]
fn malformed_reply_fails_the_exchange_only() {
    let connection = Arc::new(AgentConnection::new(loopback()));
    let step = AgentWaitStep::new(
        connection.clone(),
        StepConfig::new().with_timeout(Duration::from_secs(2)),
    )
    .unwrap();
    let run = connection.start_run().unwrap();
    let addr = run.local_addr();

    let agent = thread::spawn(move || {
        let mut endpoint = AgentEndpoint::connect(addr, Duration::from_secs(2)).unwrap();
        endpoint.recv_raw(None).unwrap();
        endpoint.send_raw(r#"{"Action": "north"}"#).unwrap();
        endpoint.recv_raw(None).unwrap();
        endpoint.send_raw(r#"{"Action": 1.0, "IsNoOp": true, "Debug": [1, 2]}"#).unwrap();
    });

    let mut host = host_with(1.0, &[]);
    let first = step.execute(&mut host);
    assert_eq!(first.failure().map(|failure| failure.phase), Some(Phase::Applying));
    assert_eq!(host.get("Action"), Some(-1.0));

    let second = step.execute(&mut host);
    assert_eq!(second.branch(), Some(Branch::Alternate));
    assert_eq!(host.get("Action"), Some(1.0));
    assert_eq!(host.errors().len(), 1);

    agent.join().unwrap();
}

#[test]
fn concurrent_steps_on_one_connection_never_interleave() {
    const STEPS_PER_WORKER: usize = 20;

    let connection = Arc::new(AgentConnection::new(loopback()));
    let run = connection.start_run().unwrap();
    let addr = run.local_addr();

    // The agent answers each request with a value derived from it, so any
    // crossed replies would show up as a wrong action on the caller's side.
    let agent = thread::spawn(move || {
        let mut endpoint = AgentEndpoint::connect(addr, Duration::from_secs(2)).unwrap();
        endpoint
            .serve(|request| {
                thread::sleep(Duration::from_millis(2));
                AgentResponse::act(request.episode_number * 1000.0 + request.states[0])
            })
            .unwrap()
    });

    let workers: Vec<_> = (1..=3)
        .map(|episode| {
            let step = AgentWaitStep::new(
                connection.clone(),
                StepConfig::new()
                    .with_state("Tick")
                    .with_timeout(Duration::from_secs(5)),
            )
            .unwrap();
            thread::spawn(move || {
                let mut host = host_with(f64::from(episode), &[("Tick", 0.0)]);
                for tick in 0..STEPS_PER_WORKER {
                    host.set("Tick", tick as f64);
                    let outcome = step.execute(&mut host);
                    assert_eq!(
                        outcome.action(),
                        Some(f64::from(episode) * 1000.0 + tick as f64),
                        "worker {episode} received a reply meant for another request"
                    );
                }
                host.errors().len()
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap(), 0);
    }

    drop(run);
    assert_eq!(agent.join().unwrap(), 3 * STEPS_PER_WORKER as u64);
}

#[test]
fn configuration_errors_surface_without_traffic() {
    let connection = Arc::new(AgentConnection::new(loopback()));
    let step = AgentWaitStep::new(
        connection.clone(),
        StepConfig::new()
            .with_states(["Queue", "Missing"])
            .with_timeout(Duration::from_millis(200)),
    )
    .unwrap();
    let run = connection.start_run().unwrap();
    let addr = run.local_addr();

    let agent = thread::spawn(move || {
        let mut endpoint = AgentEndpoint::connect(addr, Duration::from_secs(2)).unwrap();
        endpoint.recv_raw(Some(Duration::from_millis(300)))
    });

    let mut host = host_with(1.0, &[("Queue", 1.0)]);
    let outcome = step.execute(&mut host);
    let failure = outcome.failure().expect("binding is missing");
    assert_eq!(failure.phase, Phase::Idle);
    assert!(matches!(failure.error, BridgeError::MissingState(ref name) if name == "Missing"));

    let received = agent.join().unwrap();
    assert!(
        matches!(received, Err(BridgeError::ReceiveTimeout(_))),
        "nothing should reach the agent, got {received:?}"
    );
    drop(run);
}
