//! Tests for the admin task engine
//!
//! These tests verify:
//! - Each cache administration task against a live cache manager
//! - Missing parameters, unknown tasks and unknown engines being refused
//! - Engine registration through the local task manager

use std::sync::Arc;

use hotwire::server::admin::TaskParameters;
use hotwire::server::{
    AdminOperationsHandler, LocalTaskManager, ServerAdminOperationsHandler, TaskManager,
};
use hotwire::{CacheManager, ErrorKind, LocalCacheManager, WireError};

// =============================================================================
// Helper Functions
// =============================================================================

fn cache_manager() -> Arc<LocalCacheManager> {
    let manager = Arc::new(LocalCacheManager::new("admin").with_caches(["users"]));
    manager.start().unwrap();
    manager
}

fn task_manager() -> LocalTaskManager {
    let tasks = LocalTaskManager::new();
    tasks
        .register_engine(Arc::new(ServerAdminOperationsHandler::new()))
        .unwrap();
    tasks
}

fn named(name: &str) -> TaskParameters {
    let mut parameters = TaskParameters::new();
    parameters.insert("name".to_string(), name.to_string());
    parameters
}

fn run(
    tasks: &LocalTaskManager,
    task: &str,
    parameters: &TaskParameters,
    manager: &LocalCacheManager,
) -> hotwire::Result<String> {
    tasks.run_task(ServerAdminOperationsHandler::NAME, task, parameters, manager)
}

// =============================================================================
// Task Tests
// =============================================================================

#[test]
fn test_cache_create() {
    let manager = cache_manager();
    let tasks = task_manager();
    assert!(!manager.cache_exists("reports"));

    assert_eq!(run(&tasks, "cache-create", &named("reports"), &manager).unwrap(), "reports");
    assert!(manager.cache_exists("reports"));

    // Creating an existing cache keeps its contents
    manager.get_cache("reports").unwrap().put(b"k".to_vec(), b"v".to_vec());
    run(&tasks, "cache-create", &named("reports"), &manager).unwrap();
    assert_eq!(manager.get_cache("reports").unwrap().get(b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_cache_remove_existing() {
    let manager = cache_manager();
    let tasks = task_manager();

    assert_eq!(run(&tasks, "cache-remove", &named("users"), &manager).unwrap(), "users");
    assert!(!manager.cache_exists("users"));
}

#[test]
fn test_cache_remove_missing() {
    let manager = cache_manager();
    let tasks = task_manager();

    let err = run(&tasks, "cache-remove", &named("ghost"), &manager).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn test_cache_names() {
    let manager = cache_manager();
    let tasks = task_manager();
    run(&tasks, "cache-create", &named("archive"), &manager).unwrap();

    let names = run(&tasks, "cache-names", &TaskParameters::new(), &manager).unwrap();
    assert_eq!(names, "archive,default,users");
}

#[test]
fn test_missing_name_parameter() {
    let manager = cache_manager();
    let tasks = task_manager();

    for task in ["cache-create", "cache-remove"] {
        let err = run(&tasks, task, &TaskParameters::new(), &manager).unwrap_err();
        assert!(matches!(err, WireError::Config(_)));
        assert!(err.to_string().contains("'name'"));

        let err = run(&tasks, task, &named(""), &manager).unwrap_err();
        assert!(matches!(err, WireError::Config(_)));
    }
    assert_eq!(manager.cache_names(), vec!["default".to_string(), "users".to_string()]);
}

#[test]
fn test_unknown_task() {
    let manager = cache_manager();
    let tasks = task_manager();

    let err = run(&tasks, "cache-rename", &named("users"), &manager).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("cache-rename"));
    assert!(manager.cache_exists("users"));
}

#[test]
fn test_unknown_engine() {
    let manager = cache_manager();
    let tasks = task_manager();

    let err = tasks
        .run_task("cluster-admin", "cache-create", &named("reports"), manager.as_ref())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("cluster-admin"));
    assert!(!manager.cache_exists("reports"));
}

// =============================================================================
// Registration Tests
// =============================================================================

#[test]
fn test_register_is_idempotent_and_unregister() {
    let tasks = task_manager();
    tasks
        .register_engine(Arc::new(ServerAdminOperationsHandler::new()))
        .unwrap();
    assert_eq!(tasks.engines(), vec![ServerAdminOperationsHandler::NAME.to_string()]);

    assert!(tasks.unregister_engine(ServerAdminOperationsHandler::NAME));
    assert!(!tasks.unregister_engine(ServerAdminOperationsHandler::NAME));
    assert!(tasks.engines().is_empty());
}

#[test]
fn test_handler_lists_its_tasks() {
    let handler = ServerAdminOperationsHandler::new();
    assert_eq!(handler.name(), "server-admin");
    assert_eq!(handler.tasks(), vec!["cache-create", "cache-remove", "cache-names"]);
}
