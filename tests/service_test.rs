mod common;

use async_trait::async_trait;
use common::*;
use query_builder::cancel::CancellationToken;
use query_builder::db::{QueryExecutor, QueryRows, Row};
use query_builder::error::{QueryBuilderError, Result};
use query_builder::fragment::RegistryHandle;
use query_builder::generation::GenerationSettings;
use query_builder::service::{FragmentQueryRequest, QueryBuilderService, ViewQueryRequest};
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Records executed SQL and returns one canned row
#[derive(Default)]
struct RecordingExecutor {
    executed: Mutex<Vec<String>>,
}

#[async_trait]
impl QueryExecutor for RecordingExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryRows> {
        self.executed.lock().unwrap().push(sql.to_string());
        let row: Row = json!({"student_id": 42, "attendance_rate": 0.97})
            .as_object()
            .cloned()
            .unwrap();
        Ok(QueryRows::from_rows(vec![row], 100))
    }
}

fn service(collaborator: &Arc<ScriptedCollaborator>) -> QueryBuilderService {
    QueryBuilderService::new(
        RegistryHandle::new(fixture_registry()),
        catalog(),
        orchestrator(collaborator, GenerationSettings::default()),
    )
}

fn view_request(execute: bool) -> ViewQueryRequest {
    ViewQueryRequest {
        prompt: "attendance rate for every student".to_string(),
        execute,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_fragment_response_shape() {
    let collaborator = ScriptedCollaborator::new(vec![Step::Reply(
        r#"{"fragments": ["grade_3", "school_jefferson", "order_last_name"]}"#,
    )]);
    let service = service(&collaborator);
    let request = FragmentQueryRequest {
        prompt: "third graders at Jefferson".to_string(),
        ..Default::default()
    };

    let (status, response) = service.respond_fragment(&request, &CancellationToken::new()).await;
    assert_eq!(status, 200);
    assert!(response.success);

    let formatted = response.formatted_sql.as_deref().unwrap();
    assert!(formatted.starts_with("SELECT s.student_id"));
    assert!(formatted.contains("\nWHERE s.grade_level = 3\n  AND sch.school_name = 'Jefferson Elementary'"));
    assert!(formatted.ends_with("\nORDER BY s.last_name, s.first_name"));

    let explanation = response.explanation.as_ref().unwrap();
    assert_eq!(explanation.sections.len(), 5);
    assert_eq!(explanation.sections[0].name, "Enrolled students");
    assert!(explanation.summary.contains("school_jefferson"));

    let metadata = response.metadata.as_ref().unwrap();
    assert_eq!(
        metadata.fragments_used,
        vec!["base_students", "join_schools", "grade_3", "school_jefferson", "order_last_name"]
    );

    let body = serde_json::to_value(response.clone().without_debug_info()).unwrap();
    assert!(body.get("debugInfo").is_none());
    assert!(body.get("error").is_none());
    assert!(body.get("formattedSql").is_some());
    assert_eq!(body["metadata"]["fragmentsUsed"][0], "base_students");
}

#[tokio::test]
async fn test_unknown_fragment_from_filter_is_a_client_error() {
    let collaborator = ScriptedCollaborator::new(vec![Step::Reply(r#"{"fragments": []}"#)]);
    let service = service(&collaborator);
    let request: FragmentQueryRequest = serde_json::from_value(json!({
        "prompt": "students at Jeferson",
        "filters": [{"field": "school", "values": ["Jefferson"], "fragmentId": "school_jeferson"}]
    }))
    .unwrap();

    let (status, response) = service.respond_fragment(&request, &CancellationToken::new()).await;
    assert_eq!(status, 400);
    assert!(!response.success);
    let error = response.error.unwrap();
    assert!(error.contains("school_jeferson"));
    assert!(error.contains("did you mean 'school_jefferson'"));
    assert_eq!(collaborator.calls(), 0);
}

#[tokio::test]
async fn test_view_execution_runs_only_validated_sql() {
    let collaborator = ScriptedCollaborator::new(vec![
        Step::Reply(UNKNOWN_VIEW_REPLY),
        Step::Reply(VALID_VIEW_REPLY),
    ]);
    let executor = Arc::new(RecordingExecutor::default());
    let service = service(&collaborator).with_executor(executor.clone());

    let (status, response) = service.respond_view(&view_request(true), &CancellationToken::new()).await;
    assert_eq!(status, 200);
    assert!(response.success);

    let executed = executor.executed.lock().unwrap().clone();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("llm_student_attendance"));
    assert!(!executed[0].contains("secret_table"));

    let data = response.data.as_ref().unwrap();
    assert_eq!(data[0]["student_id"], 42);

    let metadata = response.metadata.as_ref().unwrap();
    assert_eq!(metadata.referenced_views, vec!["llm_student_attendance"]);
    assert_eq!(metadata.attempt_count, 2);
    assert_eq!(metadata.row_count, Some(1));

    let debug = response.debug_info.as_ref().unwrap();
    assert_eq!(debug.total_attempts, 2);
    assert!(debug.attempts[0].correction_prompt.as_deref().unwrap().contains(UNKNOWN_VIEW_ERROR));
}

#[tokio::test]
async fn test_view_without_execute_returns_no_data() {
    let collaborator = ScriptedCollaborator::new(vec![Step::Reply(VALID_VIEW_REPLY)]);
    let executor = Arc::new(RecordingExecutor::default());
    let service = service(&collaborator).with_executor(executor.clone());

    let (_, response) = service.respond_view(&view_request(false), &CancellationToken::new()).await;
    assert!(response.success);
    assert!(response.data.is_none());
    assert!(executor.executed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_exhausted_view_request_reports_details_and_trace() {
    let collaborator = ScriptedCollaborator::new(vec![Step::Reply(UNKNOWN_VIEW_REPLY)]);
    let executor = Arc::new(RecordingExecutor::default());
    let service = service(&collaborator).with_executor(executor.clone());

    let (status, response) = service.respond_view(&view_request(true), &CancellationToken::new()).await;
    assert_eq!(status, 422);
    assert!(!response.success);
    assert!(response.sql.is_none());
    assert_eq!(response.details, Some(vec![UNKNOWN_VIEW_ERROR.to_string()]));
    assert_eq!(response.debug_info.as_ref().unwrap().total_attempts, 3);
    assert!(executor.executed.lock().unwrap().is_empty());

    let public = response.without_debug_info();
    assert!(public.debug_info.is_none());
    assert!(public.details.is_some());
}

#[tokio::test]
async fn test_registry_refresh_is_seen_by_later_requests() {
    let collaborator = ScriptedCollaborator::new(vec![Step::Reply(r#"{"fragments": ["grade_4"]}"#)]);
    let service = service(&collaborator);
    let before = service.active_fragments().len();

    let mut fragments: Vec<_> = fixture_registry().active().cloned().collect();
    fragments.retain(|f| f.id != "grade_4");
    for fragment in &mut fragments {
        fragment.conflicts.remove("grade_4");
    }
    let trimmed = query_builder::fragment::FragmentRegistry::new(fragments, "v2").unwrap();
    service.registry().replace(trimmed);

    assert_eq!(service.active_fragments().len(), before - 1);
    assert_eq!(service.registry().snapshot().version(), "v2");

    let request = FragmentQueryRequest {
        prompt: "fourth graders".to_string(),
        ..Default::default()
    };
    let (status, response) = service.respond_fragment(&request, &CancellationToken::new()).await;
    assert_eq!(status, 422);
    assert!(response.details.unwrap()[0].contains("grade_4"));
}

struct FailingExecutor;

#[async_trait]
impl QueryExecutor for FailingExecutor {
    async fn execute(&self, _sql: &str) -> Result<QueryRows> {
        Err(QueryBuilderError::Execution("canceling statement due to statement timeout".to_string()))
    }
}

#[tokio::test]
async fn test_execution_failure_keeps_generated_sql_and_trace() {
    let collaborator = ScriptedCollaborator::new(vec![Step::Reply(VALID_VIEW_REPLY)]);
    let service = service(&collaborator).with_executor(Arc::new(FailingExecutor));

    let (status, response) = service.respond_view(&view_request(true), &CancellationToken::new()).await;
    assert_eq!(status, 500);
    assert!(!response.success);
    assert!(response.error.as_deref().unwrap().contains("statement timeout"));
    assert!(response.sql.as_deref().unwrap().contains("llm_student_attendance"));
    assert!(response.data.is_none());
    assert_eq!(response.metadata.as_ref().unwrap().referenced_views, vec!["llm_student_attendance"]);
    assert_eq!(response.debug_info.as_ref().unwrap().total_attempts, 1);
}

#[tokio::test]
async fn test_execute_without_database_still_returns_sql() {
    let collaborator = ScriptedCollaborator::new(vec![Step::Reply(VALID_VIEW_REPLY)]);
    let service = service(&collaborator);

    let response = service
        .generate_view(&view_request(true), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!response.success);
    assert!(response.error.as_deref().unwrap().contains("no database is configured"));
    assert!(response.sql.is_some());
    assert!(response.debug_info.is_some());
}
