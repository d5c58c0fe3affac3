//! Generation Orchestrator
//!
//! Drives one request through generate, validate and correct until a
//! candidate passes validation or the attempt budget runs out. Attempts are
//! strictly sequential; every attempt is recorded in the trace.
//!
//! ```text
//! Start -> Generating -> Validating -> Done
//!              ^             |
//!              |             v
//!              +------- Correcting      (attempt < max)
//!                            |
//!                            v
//!                        Exhausted      (attempt == max, or collaborator down)
//! ```

use crate::cancel::CancellationToken;
use crate::catalog::ViewCatalog;
use crate::error::{QueryBuilderError, Result};
use crate::fragment::{FragmentRegistry, FragmentResolver, ResolvedQuery};
use crate::generation::attempt::GenerationAttempt;
use crate::generation::correction::build_correction_prompt;
use crate::generation::prompt::initial_prompt;
use crate::generation::request::GenerationRequest;
use crate::llm::{CollaboratorReply, CollaboratorRequest, GenerationCollaborator};
use crate::validator::{QueryMode, SafetyValidator, ValidationHints, ValidationResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSettings {
    pub max_attempts: u32,
    /// Per collaborator call
    pub attempt_timeout: Duration,
    /// Timeouts in a row before the collaborator is declared unavailable
    pub max_consecutive_unavailable: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            max_consecutive_unavailable: 3,
        }
    }
}

/// Final SQL for a request, with the full attempt trace
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedQuery {
    pub request_id: String,
    pub mode: QueryMode,
    pub sql: String,
    pub validation: ValidationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<ResolvedQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub attempts: Vec<GenerationAttempt>,
}

struct Candidate {
    sql: String,
    fragment_ids: Vec<String>,
    validation: ValidationResult,
    resolved: Option<ResolvedQuery>,
    explanation: Option<String>,
}

enum Exhaustion {
    AttemptsUsed,
    Unavailable(String),
}

enum GenerationState {
    Start,
    Generating {
        attempt: u32,
        prompt: String,
    },
    Validating {
        attempt: u32,
        reply: CollaboratorReply,
        started_at: DateTime<Utc>,
        started: Instant,
    },
    Correcting {
        attempt: u32,
    },
    Done(Candidate),
    Exhausted(Exhaustion),
}

enum CallOutcome {
    Reply(CollaboratorReply),
    TimedOut,
    Failed(String),
}

pub struct GenerationOrchestrator {
    collaborator: Arc<dyn GenerationCollaborator>,
    validator: SafetyValidator,
    settings: GenerationSettings,
}

impl GenerationOrchestrator {
    pub fn new(
        collaborator: Arc<dyn GenerationCollaborator>,
        validator: SafetyValidator,
        settings: GenerationSettings,
    ) -> Self {
        let settings = GenerationSettings {
            max_attempts: settings.max_attempts.max(1),
            max_consecutive_unavailable: settings.max_consecutive_unavailable.max(1),
            ..settings
        };
        Self {
            collaborator,
            validator,
            settings,
        }
    }

    pub fn settings(&self) -> GenerationSettings {
        self.settings
    }

    pub fn validator(&self) -> &SafetyValidator {
        &self.validator
    }

    /// Run the correction loop for one request against one registry snapshot.
    pub async fn run(
        &self,
        request: &GenerationRequest,
        registry: &FragmentRegistry,
        catalog: &ViewCatalog,
        cancel: &CancellationToken,
    ) -> Result<GeneratedQuery> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("generation", request_id = %request_id, mode = %request.mode);
        self.run_loop(request_id, request, registry, catalog, cancel)
            .instrument(span)
            .await
    }

    async fn run_loop(
        &self,
        request_id: String,
        request: &GenerationRequest,
        registry: &FragmentRegistry,
        catalog: &ViewCatalog,
        cancel: &CancellationToken,
    ) -> Result<GeneratedQuery> {
        // Ids chosen by the caller are checked before any generation; a bad
        // seed is a request error, not something the model can fix.
        let seeds = match request.mode {
            QueryMode::Fragment => request.seed_fragment_ids(),
            QueryMode::View => BTreeSet::new(),
        };
        if !seeds.is_empty() {
            FragmentResolver::new(registry).resolve(&seeds)?;
        }

        let first_prompt = initial_prompt(request, registry, catalog);
        let mut attempts: Vec<GenerationAttempt> = Vec::new();
        let mut consecutive_timeouts = 0u32;
        let mut state = GenerationState::Start;

        loop {
            state = match state {
                GenerationState::Start => {
                    info!("🚀 Generating {} query: {}", request.mode, request.prompt);
                    GenerationState::Generating {
                        attempt: 1,
                        prompt: first_prompt.clone(),
                    }
                }

                GenerationState::Generating { attempt, prompt } => {
                    info!("Attempt {}/{}", attempt, self.settings.max_attempts);
                    let started_at = Utc::now();
                    let started = Instant::now();
                    let call = CollaboratorRequest {
                        mode: request.mode,
                        attempt,
                        prompt,
                    };

                    match self.call_collaborator(&call, cancel).await? {
                        CallOutcome::Reply(reply) => {
                            consecutive_timeouts = 0;
                            GenerationState::Validating {
                                attempt,
                                reply,
                                started_at,
                                started,
                            }
                        }
                        CallOutcome::TimedOut => {
                            consecutive_timeouts += 1;
                            let message = format!(
                                "Generation service timed out after {}s",
                                self.settings.attempt_timeout.as_secs_f64()
                            );
                            warn!("⏱️ Attempt {}: {}", attempt, message);
                            attempts.push(GenerationAttempt {
                                attempt_number: attempt,
                                sql: String::new(),
                                fragment_ids: Vec::new(),
                                validation: ValidationResult::failed(vec![message]),
                                correction_prompt: None,
                                started_at,
                                elapsed_ms: elapsed_ms(started),
                            });

                            if consecutive_timeouts >= self.settings.max_consecutive_unavailable {
                                GenerationState::Exhausted(Exhaustion::Unavailable(format!(
                                    "{} consecutive calls timed out",
                                    consecutive_timeouts
                                )))
                            } else {
                                self.after_failure(attempt)
                            }
                        }
                        CallOutcome::Failed(reason) => {
                            warn!("❌ Attempt {}: generation service failed: {}", attempt, reason);
                            GenerationState::Exhausted(Exhaustion::Unavailable(reason))
                        }
                    }
                }

                GenerationState::Validating {
                    attempt,
                    reply,
                    started_at,
                    started,
                } => {
                    let candidate = self.evaluate(request, &seeds, &reply, registry, catalog);
                    attempts.push(GenerationAttempt {
                        attempt_number: attempt,
                        sql: candidate.sql.clone(),
                        fragment_ids: candidate.fragment_ids.clone(),
                        validation: candidate.validation.clone(),
                        correction_prompt: None,
                        started_at,
                        elapsed_ms: elapsed_ms(started),
                    });

                    if candidate.validation.valid {
                        GenerationState::Done(candidate)
                    } else {
                        warn!(
                            "Attempt {} failed validation: {}",
                            attempt,
                            candidate.validation.errors.join("; ")
                        );
                        self.after_failure(attempt)
                    }
                }

                GenerationState::Correcting { attempt } => {
                    let allowed = match request.mode {
                        QueryMode::View => catalog.known_views(),
                        QueryMode::Fragment => registry.active_ids(),
                    };
                    let prompt = match attempts.last_mut() {
                        Some(last) => {
                            let correction =
                                build_correction_prompt(&first_prompt, last, request.mode, &allowed);
                            last.correction_prompt = Some(correction.clone());
                            correction
                        }
                        None => first_prompt.clone(),
                    };
                    GenerationState::Generating {
                        attempt: attempt + 1,
                        prompt,
                    }
                }

                GenerationState::Done(candidate) => {
                    info!("✅ Valid SQL after {} attempt(s)", attempts.len());
                    return Ok(GeneratedQuery {
                        request_id,
                        mode: request.mode,
                        sql: candidate.sql,
                        validation: candidate.validation,
                        resolved: candidate.resolved,
                        explanation: candidate.explanation,
                        attempts,
                    });
                }

                GenerationState::Exhausted(Exhaustion::AttemptsUsed) => {
                    warn!("No valid SQL after {} attempts", self.settings.max_attempts);
                    return Err(QueryBuilderError::AttemptsExhausted {
                        max_attempts: self.settings.max_attempts,
                        attempts,
                    });
                }

                GenerationState::Exhausted(Exhaustion::Unavailable(reason)) => {
                    return Err(QueryBuilderError::CollaboratorUnavailable { reason, attempts });
                }
            };
        }
    }

    fn after_failure(&self, attempt: u32) -> GenerationState {
        if attempt < self.settings.max_attempts {
            GenerationState::Correcting { attempt }
        } else {
            GenerationState::Exhausted(Exhaustion::AttemptsUsed)
        }
    }

    async fn call_collaborator(
        &self,
        call: &CollaboratorRequest,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome> {
        if cancel.is_cancelled() {
            return Err(QueryBuilderError::Cancelled);
        }

        let generation = tokio::time::timeout(self.settings.attempt_timeout, self.collaborator.generate(call));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Request cancelled during attempt {}", call.attempt);
                Err(QueryBuilderError::Cancelled)
            }
            outcome = generation => Ok(match outcome {
                Ok(Ok(reply)) => CallOutcome::Reply(reply),
                Ok(Err(e)) => CallOutcome::Failed(e.to_string()),
                Err(_) => CallOutcome::TimedOut,
            }),
        }
    }

    /// Turn a reply into SQL and validate it. Problems the model caused
    /// (unknown ids, conflicts, no base) become validation errors so the
    /// correction loop can address them.
    fn evaluate(
        &self,
        request: &GenerationRequest,
        seeds: &BTreeSet<String>,
        reply: &CollaboratorReply,
        registry: &FragmentRegistry,
        catalog: &ViewCatalog,
    ) -> Candidate {
        match request.mode {
            QueryMode::View => {
                let sql = reply.sql.clone().unwrap_or_default();
                let requested = request.requested_objects();
                let hints = ValidationHints {
                    expects_pagination: request.paginate,
                    requested_objects: (!requested.is_empty()).then_some(requested),
                };
                let validation =
                    self.validator
                        .validate_with(&sql, QueryMode::View, &catalog.known_views(), &hints);
                Candidate {
                    sql,
                    fragment_ids: Vec::new(),
                    validation,
                    resolved: None,
                    explanation: reply.explanation.clone(),
                }
            }
            QueryMode::Fragment => {
                let ids: BTreeSet<String> = seeds
                    .iter()
                    .cloned()
                    .chain(reply.fragment_ids.iter().cloned())
                    .collect();
                let fragment_ids: Vec<String> = ids.iter().cloned().collect();
                let rejected = |sql: String, errors: Vec<String>, resolved: Option<ResolvedQuery>| Candidate {
                    sql,
                    fragment_ids: fragment_ids.clone(),
                    validation: ValidationResult::failed(errors),
                    resolved,
                    explanation: reply.explanation.clone(),
                };

                if ids.is_empty() {
                    return rejected(String::new(), vec!["No fragments were selected".to_string()], None);
                }
                let resolved = match FragmentResolver::new(registry).resolve(&ids) {
                    Ok(resolved) => resolved,
                    Err(e) => return rejected(String::new(), vec![e.to_string()], None),
                };
                let sql = match resolved.sql() {
                    Ok(sql) => sql,
                    Err(e) => {
                        return rejected(resolved.clause_text.clone(), vec![e.to_string()], Some(resolved))
                    }
                };

                let mut requested = resolved.requested_tables();
                requested.extend(request.requested_objects());
                let hints = ValidationHints {
                    expects_pagination: request.paginate,
                    requested_objects: Some(requested),
                };
                let validation =
                    self.validator
                        .validate_with(&sql, QueryMode::Fragment, &resolved.tables, &hints);

                Candidate {
                    sql,
                    fragment_ids,
                    validation,
                    resolved: Some(resolved),
                    explanation: reply.explanation.clone(),
                }
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
