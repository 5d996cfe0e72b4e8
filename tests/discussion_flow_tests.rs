use async_trait::async_trait;
use concord::client_wrapper::{ChatMessage, GatewayClient, GatewayError};
use concord::config::EngineConfig;
use concord::event_bus::{DiscussionEvent, Subscription};
use concord::orchestrator::{
    CreateDiscussionRequest, DiscussionOrchestrator, DiscussionStatus, OrchestratorError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

const TOPIC: &str = "Should the city invest in light rail or expand the bus network?";

/// Distinct filler positions so the stalemate heuristic stays quiet unless a
/// test wants it to fire.
const VARIED_UTTERANCES: &[&str] = &[
    "Light rail offers higher capacity corridors but demands decades of capital commitment",
    "Bus expansion is cheaper per mile and reroutes flexibly as the city grows outward",
    "Ridership projections hinge on frequency, and frequency is where buses win early",
    "Transit oriented development around fixed rail stations compounds land value gains",
    "Electric fleets close most of the emissions gap regardless of mode choice",
    "Mixed strategies phase rail on trunk lines while buses feed the network edges",
    "Labor costs dominate operating budgets, which favors larger rail consists long term",
    "Construction disruption along dense corridors carries real economic downside",
    "Fare integration matters more to riders than the vehicle technology itself",
    "Peer cities saw mode share shift only after dedicated lanes were enforced",
    "Accessibility upgrades reach more residents through distributed bus stops",
    "Financing through value capture districts spreads risk across beneficiaries",
];

/// Scripted gateway for whole-discussion runs.
///
/// Routes calls by prompt shape: speaker picks fail (driving the
/// deterministic fallback), utterances come from a fixed sentence or the
/// varied pool, consensus answers carry a fixed confidence.
struct EngineStubGateway {
    personas: serde_json::Value,
    consensus_confidence: f64,
    fixed_utterance: Option<String>,
    utterance_counter: Mutex<usize>,
    utterance_transcripts: Mutex<Vec<Vec<(String, String)>>>,
    /// When set, utterance call `gate_at` (1-based) signals `reached` and
    /// waits for `permit` before answering.
    gate_at: Option<usize>,
    reached: Notify,
    permit: Notify,
}

impl EngineStubGateway {
    fn build(
        consensus_confidence: f64,
        fixed_utterance: Option<&str>,
        gate_at: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            personas: serde_json::json!({"roles": [
                {"name": "Planner", "expertise": "Transit network design", "perspective": "System-wide efficiency"},
                {"name": "Economist", "expertise": "Infrastructure financing", "perspective": "Cost-benefit discipline"},
                {"name": "Resident", "expertise": "Daily commuting experience", "perspective": "Street-level usability"}
            ]}),
            consensus_confidence,
            fixed_utterance: fixed_utterance.map(|s| s.to_string()),
            utterance_counter: Mutex::new(0),
            utterance_transcripts: Mutex::new(Vec::new()),
            gate_at,
            reached: Notify::new(),
            permit: Notify::new(),
        })
    }

    fn new(consensus_confidence: f64, fixed_utterance: Option<&str>) -> Arc<Self> {
        Self::build(consensus_confidence, fixed_utterance, None)
    }

    fn with_gate(consensus_confidence: f64, gate_at: usize) -> Arc<Self> {
        Self::build(consensus_confidence, None, Some(gate_at))
    }
}

#[async_trait]
impl GatewayClient for EngineStubGateway {
    async fn complete_text(
        &self,
        _model_id: &str,
        transcript: &[ChatMessage],
        _temperature: f32,
        _max_output_tokens: Option<u32>,
    ) -> Result<String, GatewayError> {
        let prompt = transcript
            .last()
            .map(|m| m.content.to_string())
            .unwrap_or_default();

        if prompt.contains("who should speak next") {
            return Err(GatewayError::Transport("speaker pick unavailable".to_string()));
        }
        if prompt.contains("comprehensive summary") {
            return Ok("Executive summary: the panel weighed rail against buses.".to_string());
        }

        // Agent utterance: capture the transcript the role saw.
        let snapshot: Vec<(String, String)> = transcript
            .iter()
            .map(|m| (m.role.wire_label().to_string(), m.content.to_string()))
            .collect();
        self.utterance_transcripts.lock().await.push(snapshot);

        let call = {
            let mut counter = self.utterance_counter.lock().await;
            *counter += 1;
            *counter
        };

        if self.gate_at == Some(call) {
            self.reached.notify_one();
            self.permit.notified().await;
        }

        match &self.fixed_utterance {
            Some(fixed) => Ok(fixed.clone()),
            None => Ok(VARIED_UTTERANCES[(call - 1) % VARIED_UTTERANCES.len()].to_string()),
        }
    }

    async fn complete_json(
        &self,
        _model_id: &str,
        transcript: &[ChatMessage],
        _temperature: f32,
    ) -> Result<serde_json::Value, GatewayError> {
        let prompt = transcript
            .last()
            .map(|m| m.content.to_string())
            .unwrap_or_default();

        if prompt.contains("Analyze this discussion topic") {
            return Ok(serde_json::json!({
                "primary_domain": "urban planning",
                "sub_domains": ["transit"],
                "complexity": 3,
                "key_aspects": ["cost", "ridership"],
                "recommended_expert_types": ["Planner"]
            }));
        }
        if prompt.contains("expert roles for a discussion") {
            return Ok(self.personas.clone());
        }

        // Consensus analysis.
        Ok(serde_json::json!({
            "confidence": self.consensus_confidence,
            "summary": "current state of the debate",
            "agreements": ["transit investment is needed"],
            "disagreements": ["which mode to fund first"]
        }))
    }
}

async fn create(
    orchestrator: &DiscussionOrchestrator,
    max_turns: Option<u32>,
) -> concord::orchestrator::CreateDiscussionResponse {
    let _ = env_logger::builder().is_test(true).try_init();
    orchestrator
        .create_discussion(CreateDiscussionRequest {
            topic: TOPIC.to_string(),
            user_tag: "tester".to_string(),
            num_agents: 3,
            preferred_models: None,
            max_turns,
        })
        .await
        .expect("create should succeed")
}

async fn drain(subscription: &mut Subscription) -> Vec<DiscussionEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), subscription.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => break,
            Err(_) => panic!("event stream did not close"),
        }
    }
    events
}

// Happy path: a concurring panel converges at the first even-numbered
// consensus check, which lands on turn 4.
#[tokio::test]
async fn consensus_reached_terminates_at_turn_four() {
    let gateway = EngineStubGateway::new(0.95, Some("I concur."));
    let orchestrator = Arc::new(DiscussionOrchestrator::new(
        gateway.clone(),
        EngineConfig::default(),
    ));
    let created = create(&orchestrator, None).await;
    let mut subscription = orchestrator.subscribe(&created.id).await.unwrap();

    let result = Arc::clone(&orchestrator)
        .run_discussion(&created.id, None)
        .await
        .expect("run should succeed");

    assert_eq!(result.total_turns, 4);
    assert_eq!(result.status, DiscussionStatus::Completed);
    assert!(result.consensus_reached);

    let view = orchestrator.inspect(&created.id).await.unwrap();
    assert_eq!(view.status, DiscussionStatus::Completed);
    assert!(view.consensus_reached);
    assert_eq!(view.current_turn, 4);

    let events = drain(&mut subscription).await;
    assert!(matches!(events.first(), Some(DiscussionEvent::Connected { .. })));

    let agent_turns: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            DiscussionEvent::AgentMessage { turn, .. } => Some(*turn),
            _ => None,
        })
        .collect();
    assert_eq!(agent_turns, vec![1, 2, 3, 4]);

    match events.last() {
        Some(DiscussionEvent::DiscussionComplete {
            total_turns,
            consensus_reached,
            ..
        }) => {
            assert_eq!(*total_turns, 4);
            assert!(*consensus_reached);
        }
        other => panic!("expected discussion_complete last, got {:?}", other),
    }

    // Every utterance request carried the role's system instruction first.
    let transcripts = gateway.utterance_transcripts.lock().await;
    assert_eq!(transcripts.len(), 4);
    for transcript in transcripts.iter() {
        assert_eq!(transcript[0].0, "system");
        assert!(transcript[0].1.starts_with("You are a "));
    }
}

// Turn cap: a stubbornly low confidence never converges; the loop halts at
// max_turns with status no_consensus.
#[tokio::test]
async fn turn_cap_yields_no_consensus() {
    let gateway = EngineStubGateway::new(0.2, None);
    let orchestrator = Arc::new(DiscussionOrchestrator::new(gateway, EngineConfig::default()));
    let created = create(&orchestrator, Some(5)).await;
    let mut subscription = orchestrator.subscribe(&created.id).await.unwrap();

    let result = Arc::clone(&orchestrator)
        .run_discussion(&created.id, None)
        .await
        .expect("run should succeed");

    assert_eq!(result.total_turns, 5);
    assert_eq!(result.status, DiscussionStatus::NoConsensus);
    assert!(!result.consensus_reached);

    let events = drain(&mut subscription).await;
    // The turn-4 check continues, so exactly one consensus_update goes out.
    let updates = events
        .iter()
        .filter(|e| matches!(e, DiscussionEvent::ConsensusUpdate { .. }))
        .count();
    assert_eq!(updates, 1);
    assert!(matches!(
        events.last(),
        Some(DiscussionEvent::DiscussionComplete { .. })
    ));
}

// Stalemate: identical utterances every turn trip the lexical heuristic at
// the turn-6 check and the discussion escalates out.
#[tokio::test]
async fn repeated_positions_escalate_by_turn_six() {
    let gateway = EngineStubGateway::new(
        0.2,
        Some("We must always prioritize the exact same fundamental approach here."),
    );
    let orchestrator = Arc::new(DiscussionOrchestrator::new(gateway, EngineConfig::default()));
    let created = create(&orchestrator, None).await;
    let mut subscription = orchestrator.subscribe(&created.id).await.unwrap();

    let result = Arc::clone(&orchestrator)
        .run_discussion(&created.id, None)
        .await
        .expect("run should succeed");

    assert_eq!(result.total_turns, 6);
    assert_eq!(result.status, DiscussionStatus::NoConsensus);
    assert!(!result.consensus_reached);

    let events = drain(&mut subscription).await;
    assert!(matches!(
        events.last(),
        Some(DiscussionEvent::DiscussionComplete { .. })
    ));
}

// Stop mid-flight: the loop discards the in-flight turn, appends nothing
// after the stop, and discussion_stopped is the stream's final event.
#[tokio::test]
async fn stop_mid_turn_discards_inflight_utterance() {
    let gateway = EngineStubGateway::with_gate(0.2, 3);
    let orchestrator = Arc::new(DiscussionOrchestrator::new(
        gateway.clone(),
        EngineConfig::default(),
    ));
    let created = create(&orchestrator, None).await;
    let mut subscription = orchestrator.subscribe(&created.id).await.unwrap();

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let id = created.id.clone();
        tokio::spawn(async move { orchestrator.run_discussion(&id, None).await })
    };

    // Wait until turn 3's utterance is in flight, then stop.
    tokio::time::timeout(Duration::from_secs(5), gateway.reached.notified())
        .await
        .expect("gate should be reached");
    let ack = orchestrator.stop(&created.id).await.unwrap();
    assert_eq!(ack.status, DiscussionStatus::Stopped);
    gateway.permit.notify_one();

    let result = runner.await.unwrap().expect("run should finish");
    assert_eq!(result.status, DiscussionStatus::Stopped);

    // No agent message landed for the stopped turn.
    let page = orchestrator.transcript(&created.id, 100, 0).await.unwrap();
    let max_turn = page.messages.iter().map(|m| m.turn).max().unwrap_or(0);
    assert!(max_turn <= 2, "no agent message past the stop, got turn {}", max_turn);

    let events = drain(&mut subscription).await;
    match events.last() {
        Some(DiscussionEvent::DiscussionStopped { reason, .. }) => {
            assert!(!reason.is_empty())
        }
        other => panic!("expected discussion_stopped last, got {:?}", other),
    }

    // Post-stop interjections are rejected.
    let err = orchestrator
        .post_user_message(&created.id, "late to the party", "tester")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Terminated(_)));
}

// Transcript and turn monotonicity over a full run.
#[tokio::test]
async fn transcript_sequences_and_turns_are_monotonic() {
    let gateway = EngineStubGateway::new(0.2, None);
    let orchestrator = Arc::new(DiscussionOrchestrator::new(gateway, EngineConfig::default()));
    let created = create(&orchestrator, Some(5)).await;

    Arc::clone(&orchestrator)
        .run_discussion(&created.id, None)
        .await
        .expect("run should succeed");

    let page = orchestrator.transcript(&created.id, 100, 0).await.unwrap();
    assert!(page.count >= 6); // framing + five turns

    for (i, message) in page.messages.iter().enumerate() {
        assert_eq!(message.sequence, i as u64 + 1);
        if i > 0 {
            assert!(page.messages[i - 1].created_at <= message.created_at);
            assert!(page.messages[i - 1].turn <= message.turn);
        }
    }

    // Framing message: sequence 1, turn 0, exactly once.
    assert_eq!(page.messages[0].turn, 0);
    assert_eq!(page.messages[0].author_name, "System");

    let view = orchestrator.inspect(&created.id).await.unwrap();
    let last_agent_turn = page.messages.iter().map(|m| m.turn).max().unwrap();
    assert_eq!(view.current_turn, last_agent_turn);

    // Paging slices the same ordered sequence.
    let paged = orchestrator.transcript(&created.id, 2, 1).await.unwrap();
    assert_eq!(paged.count, 2);
    assert_eq!(paged.messages[0].sequence, 2);
    assert_eq!(paged.messages[1].sequence, 3);
}

// Terminal stickiness: once a discussion completes, its status never moves
// and a late subscriber sees only the greeting before end-of-stream.
#[tokio::test]
async fn terminal_status_is_sticky() {
    let gateway = EngineStubGateway::new(0.95, Some("I concur."));
    let orchestrator = Arc::new(DiscussionOrchestrator::new(gateway, EngineConfig::default()));
    let created = create(&orchestrator, None).await;

    Arc::clone(&orchestrator)
        .run_discussion(&created.id, None)
        .await
        .expect("run should succeed");

    let ack = orchestrator.stop(&created.id).await.unwrap();
    assert_eq!(ack.status, DiscussionStatus::Completed);

    let view = orchestrator.inspect(&created.id).await.unwrap();
    assert_eq!(view.status, DiscussionStatus::Completed);

    let mut late = orchestrator.subscribe(&created.id).await.unwrap();
    assert!(matches!(
        late.recv().await,
        Some(DiscussionEvent::Connected { .. })
    ));
    assert!(late.recv().await.is_none());
}

// At most one background runner per discussion.
#[tokio::test]
async fn second_runner_is_rejected() {
    let gateway = EngineStubGateway::new(0.95, Some("I concur."));
    let orchestrator = Arc::new(DiscussionOrchestrator::new(gateway, EngineConfig::default()));
    let created = create(&orchestrator, None).await;

    Arc::clone(&orchestrator)
        .run_discussion(&created.id, None)
        .await
        .expect("first run should succeed");

    let err = Arc::clone(&orchestrator)
        .run_discussion(&created.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let gateway = EngineStubGateway::new(0.2, None);
    let orchestrator = Arc::new(DiscussionOrchestrator::new(gateway, EngineConfig::default()));
    let created = create(&orchestrator, None).await;

    orchestrator.delete(&created.id).await.unwrap();
    orchestrator.delete(&created.id).await.unwrap();
    orchestrator.delete("never-existed").await.unwrap();

    let err = orchestrator.inspect(&created.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn unknown_discussion_operations_return_not_found() {
    let gateway = EngineStubGateway::new(0.2, None);
    let orchestrator = Arc::new(DiscussionOrchestrator::new(gateway, EngineConfig::default()));

    assert!(matches!(
        orchestrator.inspect("missing").await.unwrap_err(),
        OrchestratorError::NotFound(_)
    ));
    assert!(matches!(
        orchestrator.stop("missing").await.unwrap_err(),
        OrchestratorError::NotFound(_)
    ));
    assert!(matches!(
        orchestrator.subscribe("missing").await.unwrap_err(),
        OrchestratorError::NotFound(_)
    ));
    assert!(matches!(
        orchestrator
            .post_user_message("missing", "hello there", "tester")
            .await
            .unwrap_err(),
        OrchestratorError::NotFound(_)
    ));
    assert!(matches!(
        Arc::clone(&orchestrator)
            .run_discussion("missing", None)
            .await
            .unwrap_err(),
        OrchestratorError::NotFound(_)
    ));
}

#[tokio::test]
async fn shutdown_fails_live_discussions_and_closes_streams() {
    let gateway = EngineStubGateway::new(0.2, None);
    let orchestrator = Arc::new(DiscussionOrchestrator::new(gateway, EngineConfig::default()));
    let created = create(&orchestrator, None).await;
    let mut subscription = orchestrator.subscribe(&created.id).await.unwrap();

    orchestrator.shutdown().await;

    let view = orchestrator.inspect(&created.id).await.unwrap();
    assert_eq!(view.status, DiscussionStatus::Failed);

    subscription.recv().await; // greeting
    assert!(subscription.recv().await.is_none());
}
