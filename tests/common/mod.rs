#![allow(dead_code)]

use async_trait::async_trait;
use query_builder::catalog::ViewCatalog;
use query_builder::error::{QueryBuilderError, Result};
use query_builder::fragment::FragmentRegistry;
use query_builder::generation::{GenerationOrchestrator, GenerationSettings};
use query_builder::llm::{CollaboratorReply, CollaboratorRequest, GenerationCollaborator};
use query_builder::validator::SafetyValidator;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const VALID_VIEW_REPLY: &str = r#"{"sql": "SELECT student_id, school_year, attendance_rate FROM llm_student_attendance ORDER BY student_id", "referencedViews": ["llm_student_attendance"], "explanation": "Attendance rate per student"}"#;

pub const UNKNOWN_VIEW_REPLY: &str = r#"{"sql": "SELECT student_id FROM secret_table", "referencedViews": ["secret_table"]}"#;

pub const UNKNOWN_VIEW_ERROR: &str =
    "Unknown view 'secret_table': only approved catalog views may be referenced";

pub fn fixture_registry() -> FragmentRegistry {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/fragments.json");
    FragmentRegistry::load(&path).expect("fixture registry loads")
}

pub fn catalog() -> ViewCatalog {
    ViewCatalog::default_catalog()
}

/// What the scripted collaborator does on a given call
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Reply(&'static str),
    Fail(&'static str),
    Hang,
}

/// Plays back `steps` in order; the last step repeats once the script runs out.
pub struct ScriptedCollaborator {
    steps: Vec<Step>,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCollaborator {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        assert!(!steps.is_empty());
        Arc::new(Self {
            steps,
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationCollaborator for ScriptedCollaborator {
    async fn generate(&self, request: &CollaboratorRequest) -> Result<CollaboratorReply> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        self.prompts.lock().unwrap().push(request.prompt.clone());

        match self.steps[index.min(self.steps.len() - 1)] {
            Step::Reply(raw) => Ok(CollaboratorReply::parse(request.mode, raw)),
            Step::Fail(reason) => Err(QueryBuilderError::Llm(reason.to_string())),
            Step::Hang => std::future::pending().await,
        }
    }
}

pub fn settings(max_attempts: u32, timeout: Duration) -> GenerationSettings {
    GenerationSettings {
        max_attempts,
        attempt_timeout: timeout,
        max_consecutive_unavailable: 3,
    }
}

pub fn orchestrator(
    collaborator: &Arc<ScriptedCollaborator>,
    settings: GenerationSettings,
) -> GenerationOrchestrator {
    GenerationOrchestrator::new(collaborator.clone(), SafetyValidator::default(), settings)
}
