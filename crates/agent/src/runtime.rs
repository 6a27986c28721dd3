//! Runtime orchestration: single runs, staged chains, multi-critic review
//! and the refinement loop.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use futures_util::future::join_all;
use gateway::{CallRequest, GatewayExecutor};
use proto::{AgentRole, ChainProgress, NewConversation, RunRecord, RuntimeError, SessionId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    config::{AgentProfile, AgentsConfig},
    consensus::{MultiCriticReport, findings_from, merge_consensus, select_critics},
    context::{ContextAssembler, ContextRequest},
    convergence::{ConvergenceDecision, check_convergence, extract_critical_issues},
    embedding::EmbeddingService,
    memory::SqliteMemory,
    router,
    run_log::RunLogger,
    summarize::{stage_prompt, summarize_stage},
};

/// Agent name that asks the router to pick the role.
pub const AUTO_AGENT: &str = "auto";

/// Per-run knobs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Replaces the profile model; the profile's fallback order is not used.
    pub override_model: Option<String>,
    pub session_id: Option<SessionId>,
    /// Prepend retrieved memory context when set.
    pub context: Option<ContextRequest>,
}

impl RunOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.override_model = Some(model.into());
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_context(mut self, context: ContextRequest) -> Self {
        self.context = Some(context);
        self
    }
}

/// Records of a staged chain execution.
#[derive(Debug, Clone)]
pub struct ChainReport {
    pub prompt: String,
    pub stages: Vec<RunRecord>,
}

impl ChainReport {
    pub fn total_tokens(&self) -> u32 {
        self.stages.iter().map(|r| r.total_tokens).sum()
    }

    pub fn total_duration_ms(&self) -> f64 {
        self.stages.iter().map(|r| r.duration_ms).sum()
    }

    /// `(agent, error)` for every failed stage.
    pub fn errors(&self) -> Vec<(&str, &str)> {
        self.stages
            .iter()
            .filter_map(|r| r.error.as_deref().map(|e| (r.agent.as_str(), e)))
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.stages.iter().any(RunRecord::is_error)
    }

    /// Response of the last stage that succeeded.
    pub fn final_response(&self) -> Option<&str> {
        self.stages
            .iter()
            .rev()
            .find(|r| !r.is_error())
            .map(|r| r.response.as_str())
    }
}

/// One builder → critique → convergence round.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: u32,
    /// Numbered critical issues, `None` when the critique raised none.
    pub issues: Option<String>,
    pub decision: ConvergenceDecision,
}

/// Outcome of [`AgentRuntime::refine`].
#[derive(Debug, Clone)]
pub struct RefinementReport {
    pub prompt: String,
    /// Every invocation in execution order (builders, critics, closer).
    pub stages: Vec<RunRecord>,
    pub iterations: Vec<IterationReport>,
    /// Whether the last convergence check stopped the loop.
    pub converged: bool,
    pub final_output: String,
}

impl RefinementReport {
    pub fn total_tokens(&self) -> u32 {
        self.stages.iter().map(|r| r.total_tokens).sum()
    }

    pub fn has_errors(&self) -> bool {
        self.stages.iter().any(RunRecord::is_error)
    }
}

/// The orchestration façade over routing, the gateway, memory and critics.
pub struct AgentRuntime {
    config: AgentsConfig,
    executor: Arc<GatewayExecutor>,
    memory: Option<Arc<SqliteMemory>>,
    embeddings: Option<Arc<EmbeddingService>>,
    run_log: Option<Arc<dyn RunLogger>>,
}

impl AgentRuntime {
    pub fn new(config: AgentsConfig, executor: Arc<GatewayExecutor>) -> Self {
        Self {
            config,
            executor,
            memory: None,
            embeddings: None,
            run_log: None,
        }
    }

    pub fn with_memory(mut self, memory: Arc<SqliteMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_embeddings(mut self, embeddings: Arc<EmbeddingService>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    pub fn with_run_log(mut self, run_log: Arc<dyn RunLogger>) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn config(&self) -> &AgentsConfig {
        &self.config
    }

    pub fn memory(&self) -> Option<&Arc<SqliteMemory>> {
        self.memory.as_ref()
    }

    /// Classifies `prompt` into one of the fixed roles.
    pub async fn route(&self, prompt: &str) -> AgentRole {
        router::route(&self.executor, &self.config, prompt).await
    }

    /// Runs one agent. `agent == "auto"` routes first.
    ///
    /// Model failures come back inside the record; only an unknown agent is an `Err`.
    pub async fn run(&self, agent: &str, prompt: &str, options: RunOptions) -> Result<RunRecord, RuntimeError> {
        let agent = if agent == AUTO_AGENT {
            self.route(prompt).await.as_str().to_string()
        } else {
            agent.to_string()
        };
        let profile = self.profile(&agent)?;

        let user = match (&options.context, &self.memory) {
            (Some(req), Some(memory)) => {
                let assembler = ContextAssembler::new(memory.clone(), self.embeddings.clone())
                    .with_config(&self.config.context);
                let context = assembler.build(prompt, req).await;
                if context.is_empty() {
                    prompt.to_string()
                } else {
                    format!("Relevant context from previous conversations:\n{context}\n\nCurrent request: {prompt}")
                }
            }
            _ => prompt.to_string(),
        };

        Ok(self
            .invoke(&agent, profile, &user, prompt, options.override_model.as_deref(), options.session_id.as_ref())
            .await)
    }

    /// Runs `stages` in order, each seeing a summary of the previous stage.
    pub async fn chain(&self, prompt: &str, stages: &[String]) -> Result<ChainReport, RuntimeError> {
        self.chain_inner(prompt, stages, None).await
    }

    /// Like [`chain`](Self::chain), emitting [`ChainProgress`] events as stages start and finish.
    pub async fn chain_with_progress(
        &self,
        prompt: &str,
        stages: &[String],
        progress_tx: mpsc::Sender<ChainProgress>,
    ) -> Result<ChainReport, RuntimeError> {
        self.chain_inner(prompt, stages, Some(&progress_tx)).await
    }

    async fn chain_inner(
        &self,
        prompt: &str,
        stages: &[String],
        progress_tx: Option<&mpsc::Sender<ChainProgress>>,
    ) -> Result<ChainReport, RuntimeError> {
        let stages: Vec<String> = if stages.is_empty() {
            AgentRole::ALL.iter().map(|r| r.as_str().to_string()).collect()
        } else {
            stages.to_vec()
        };
        let profiles = stages
            .iter()
            .map(|s| self.profile(s))
            .collect::<Result<Vec<_>, _>>()?;

        let total = stages.len();
        let mut records = Vec::with_capacity(total);
        let mut summary: Option<String> = None;
        for (i, (agent, profile)) in stages.iter().zip(profiles).enumerate() {
            let index = i + 1;
            if let Some(tx) = progress_tx {
                let _ = tx.try_send(ChainProgress::StageStarted {
                    index,
                    total,
                    agent: agent.clone(),
                });
            }

            let stage_input = match &summary {
                Some(summary) => stage_prompt(prompt, summary, agent),
                None => prompt.to_string(),
            };
            let record = self.invoke(agent, profile, &stage_input, &stage_input, None, None).await;
            info!(
                stage = index,
                total,
                agent = %agent,
                tokens = record.total_tokens,
                failed = record.is_error(),
                "Chain stage finished"
            );

            if let Some(tx) = progress_tx {
                let _ = tx.try_send(ChainProgress::StageFinished {
                    index,
                    total,
                    agent: agent.clone(),
                    model: record.model.clone(),
                    total_tokens: record.total_tokens,
                    failed: record.is_error(),
                });
            }

            // A failed stage leaves the previous summary in place for the next one.
            if !record.is_error() {
                summary = Some(summarize_stage(&self.executor, &self.config, agent, &record.response).await);
            }
            records.push(record);
        }

        Ok(ChainReport {
            prompt: prompt.to_string(),
            stages: records,
        })
    }

    /// Reviews `response` with the selected critics and merges their findings.
    ///
    /// Returns an empty report when multi-critic review is disabled.
    pub async fn run_multi_critic(&self, prompt: &str, response: &str) -> MultiCriticReport {
        self.multi_critic_inner(prompt, response, None).await
    }

    async fn multi_critic_inner(
        &self,
        prompt: &str,
        response: &str,
        progress_tx: Option<&mpsc::Sender<ChainProgress>>,
    ) -> MultiCriticReport {
        let multi = &self.config.multi_critic;
        if !multi.enabled {
            return MultiCriticReport::default();
        }

        let critics: Vec<(String, &AgentProfile)> =
            select_critics(prompt, response, multi, &self.config.dynamic_selection)
                .into_iter()
                .filter_map(|name| match self.config.profile(&name) {
                    Some(profile) => Some((name, profile)),
                    None => {
                        warn!(critic = %name, "Selected critic has no profile, skipping");
                        None
                    }
                })
                .collect();
        if let Some(tx) = progress_tx {
            let _ = tx.try_send(ChainProgress::CriticsSelected {
                critics: critics.iter().map(|(name, _)| name.clone()).collect(),
            });
        }
        debug!(critics = critics.len(), parallel = multi.parallel_execution, "Running critics");

        let review = review_prompt(prompt, response);
        let inputs: Vec<String> = critics
            .iter()
            .map(|(name, _)| stage_prompt_for(&review, name))
            .collect();
        let records: Vec<RunRecord> = if multi.parallel_execution {
            join_all(
                critics
                    .iter()
                    .zip(&inputs)
                    .map(|((name, profile), input)| self.invoke(name, profile, input, &review, None, None)),
            )
            .await
        } else {
            let mut records = Vec::with_capacity(critics.len());
            for ((name, profile), input) in critics.iter().zip(&inputs) {
                records.push(self.invoke(name, profile, input, &review, None, None).await);
            }
            records
        };

        let answered: Vec<(String, String)> = records
            .iter()
            .filter(|r| !r.is_error())
            .map(|r| (r.agent.clone(), r.response.clone()))
            .collect();
        let consensus = merge_consensus(
            &findings_from(answered, &multi.consensus),
            multi.consensus.threshold,
        );
        MultiCriticReport { consensus, records }
    }

    /// Builder → critique → refine until convergence or the iteration cap,
    /// then a closer stage. Degrades to [`chain`](Self::chain) when
    /// refinement is disabled.
    pub async fn refine(&self, prompt: &str) -> Result<RefinementReport, RuntimeError> {
        self.refine_inner(prompt, None).await
    }

    /// Like [`refine`](Self::refine), emitting [`ChainProgress`] events.
    pub async fn refine_with_progress(
        &self,
        prompt: &str,
        progress_tx: mpsc::Sender<ChainProgress>,
    ) -> Result<RefinementReport, RuntimeError> {
        self.refine_inner(prompt, Some(&progress_tx)).await
    }

    async fn refine_inner(
        &self,
        prompt: &str,
        progress_tx: Option<&mpsc::Sender<ChainProgress>>,
    ) -> Result<RefinementReport, RuntimeError> {
        let refinement = &self.config.refinement;
        if !refinement.enabled {
            let chain = self.chain_inner(prompt, &[], progress_tx).await?;
            let final_output = chain.final_response().unwrap_or_default().to_string();
            return Ok(RefinementReport {
                prompt: prompt.to_string(),
                stages: chain.stages,
                iterations: Vec::new(),
                converged: false,
                final_output,
            });
        }

        let builder = self.profile(AgentRole::Builder.as_str())?;
        let critic = self.profile(AgentRole::Critic.as_str())?;
        let closer = self.profile(AgentRole::Closer.as_str())?;

        let mut stages = Vec::new();
        let mut iterations = Vec::new();
        let mut converged = false;
        let mut current_output: Option<String> = None;
        let mut previous_issues: Option<String> = None;
        let mut builder_input = prompt.to_string();

        for iteration in 1..=refinement.max_iterations {
            if let Some(tx) = progress_tx {
                let _ = tx.try_send(ChainProgress::IterationStarted {
                    iteration,
                    max_iterations: refinement.max_iterations,
                });
            }

            notify_stage(progress_tx, stages.len() + 1, AgentRole::Builder.as_str());
            let built = self
                .invoke(AgentRole::Builder.as_str(), builder, &builder_input, &builder_input, None, None)
                .await;
            let failed = built.is_error();
            let output = built.response.clone();
            stages.push(built);
            if failed {
                warn!(iteration, "Builder failed, stopping refinement");
                break;
            }
            current_output = Some(output.clone());

            // `None` when no critic produced a review.
            let critique = if self.config.multi_critic.enabled {
                let report = self.multi_critic_inner(prompt, &output, progress_tx).await;
                let reviewed = report.records.iter().any(|r| !r.is_error());
                let findings = report.findings_text();
                stages.extend(report.records);
                reviewed.then_some(findings)
            } else {
                let review = review_prompt(prompt, &output);
                notify_stage(progress_tx, stages.len() + 1, AgentRole::Critic.as_str());
                let record = self
                    .invoke(
                        AgentRole::Critic.as_str(),
                        critic,
                        &stage_prompt_for(&review, AgentRole::Critic.as_str()),
                        &review,
                        None,
                        None,
                    )
                    .await;
                let text = (!record.is_error()).then(|| record.response.clone());
                stages.push(record);
                text
            };

            let Some(critique) = critique else {
                warn!(iteration, "Critique failed, stopping refinement");
                iterations.push(IterationReport {
                    iteration,
                    issues: None,
                    decision: ConvergenceDecision {
                        converged: false,
                        reason: "Critique failed; stopping without a review".to_string(),
                    },
                });
                break;
            };

            let issues = extract_critical_issues(Some(critique.as_str()), refinement);
            let decision = check_convergence(issues.as_deref(), previous_issues.as_deref());
            info!(
                iteration,
                converged = decision.converged,
                reason = %decision.reason,
                "Refinement iteration checked"
            );
            let stop = decision.converged;
            iterations.push(IterationReport {
                iteration,
                issues: issues.clone(),
                decision,
            });
            if stop {
                converged = true;
                break;
            }

            if let Some(issues) = &issues {
                builder_input = refinement_prompt(prompt, &output, issues);
            }
            previous_issues = issues;
        }

        let Some(best) = current_output else {
            return Ok(RefinementReport {
                prompt: prompt.to_string(),
                stages,
                iterations,
                converged,
                final_output: String::new(),
            });
        };

        let summary = summarize_stage(&self.executor, &self.config, AgentRole::Builder.as_str(), &best).await;
        let closer_input = stage_prompt(prompt, &summary, AgentRole::Closer.as_str());
        notify_stage(progress_tx, stages.len() + 1, AgentRole::Closer.as_str());
        let closed = self
            .invoke(AgentRole::Closer.as_str(), closer, &closer_input, &closer_input, None, None)
            .await;
        let final_output = if closed.is_error() {
            best
        } else {
            closed.response.clone()
        };
        stages.push(closed);

        Ok(RefinementReport {
            prompt: prompt.to_string(),
            stages,
            iterations,
            converged,
            final_output,
        })
    }

    fn profile(&self, agent: &str) -> Result<&AgentProfile, RuntimeError> {
        self.config
            .profile(agent)
            .ok_or_else(|| RuntimeError::UnknownAgent(agent.to_string()))
    }

    /// Calls one profile, logs the record and persists successful exchanges.
    async fn invoke(
        &self,
        agent: &str,
        profile: &AgentProfile,
        user: &str,
        recorded_prompt: &str,
        override_model: Option<&str>,
        session_id: Option<&SessionId>,
    ) -> RunRecord {
        let request = match override_model {
            Some(model) => CallRequest::new(model, profile.system.as_str(), user),
            None => CallRequest::new(profile.model.as_str(), profile.system.as_str(), user)
                .fallback_order(profile.fallback_order.clone()),
        }
        .temperature(profile.temperature)
        .max_tokens(profile.max_tokens);

        let outcome = self.executor.call(&request).await;
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut record = RunRecord::from_outcome(agent, recorded_prompt, outcome, timestamp);

        if let Some(log) = &self.run_log {
            match log.write(&record) {
                Ok(name) => record.log_file = name,
                Err(e) => warn!(agent = %agent, error = %e, "Failed to write run log"),
            }
        }
        if !record.is_error() {
            self.remember(&record, session_id).await;
        }
        record
    }

    async fn remember(&self, record: &RunRecord, session_id: Option<&SessionId>) {
        let Some(memory) = &self.memory else { return };
        if !memory.is_enabled() {
            return;
        }
        let cost = self
            .config
            .cost_for(&record.model, record.prompt_tokens, record.completion_tokens);
        let mut conv = NewConversation::new(
            record.prompt.as_str(),
            record.response.as_str(),
            record.agent.as_str(),
            record.model.as_str(),
            record.provider.as_str(),
        )
        .with_usage(i64::from(record.total_tokens), cost);
        if let Some(session) = session_id {
            conv = conv.with_session(session.clone());
        }
        if self.config.memory.generate_embeddings
            && let Some(service) = &self.embeddings
        {
            match service.encode(&format!("{}\n{}", record.prompt, record.response)).await {
                Ok(vector) => conv = conv.with_embedding(vector),
                Err(e) => warn!(agent = %record.agent, error = %e, "Embedding failed, storing without it"),
            }
        }
        match memory.store(&conv).await {
            Ok(Some(id)) => debug!(conversation_id = id, agent = %record.agent, "Conversation stored"),
            Ok(None) => {}
            Err(e) => warn!(agent = %record.agent, error = %e, "Failed to store conversation"),
        }
    }
}

/// Refinement stage start. The stage count is open-ended, so `total` is 0.
fn notify_stage(progress_tx: Option<&mpsc::Sender<ChainProgress>>, index: usize, agent: &str) {
    if let Some(tx) = progress_tx {
        let _ = tx.try_send(ChainProgress::StageStarted {
            index,
            total: 0,
            agent: agent.to_string(),
        });
    }
}

fn review_prompt(prompt: &str, response: &str) -> String {
    format!("Original request: {prompt}\n\nOutput to review:\n{response}")
}

fn stage_prompt_for(review: &str, agent: &str) -> String {
    format!("{review}\n\nYour task as {agent}:")
}

fn refinement_prompt(prompt: &str, previous: &str, issues: &str) -> String {
    format!(
        "Original request: {prompt}\n\nYour previous solution:\n{previous}\n\nCritical issues to fix:\n{issues}\n\nRevise the solution so that every issue is resolved."
    )
}
