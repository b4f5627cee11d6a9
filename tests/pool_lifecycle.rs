use std::sync::Arc;
use std::time::Duration;

use renderpool::domain::network::{NetworkEvent, NetworkRequest, RequestId, ResourceType};
use renderpool::engine::LaunchProfile;
use renderpool::engine::memory::MemoryEngine;
use renderpool::pool::{ResolveOptions, ResolverConfig, ResolverPhase, ResolverRegistry};
use renderpool::quiescence::{IgnoreUrlPrefixes, NetworkQuiescenceDetector};
use renderpool::util::wait::wait_for_predicate;

fn registry_with(engine: &MemoryEngine, end_of_life_page_count: u32) -> Arc<ResolverRegistry> {
    Arc::new(ResolverRegistry::new(
        Arc::new(engine.clone()),
        ResolverConfig {
            profile: LaunchProfile::default(),
            end_of_life_page_count,
        },
    ))
}

#[tokio::test]
async fn page_budget_recycles_the_process() {
    let engine = MemoryEngine::new();
    let registry = registry_with(&engine, 3);
    let resolver = registry
        .resolve("reports", ResolveOptions::default())
        .await
        .expect("resolver");

    for _ in 0..3 {
        let page = resolver.new_page().await.expect("page");
        page.close().await.expect("close");
    }
    let first = engine.processes()[0].clone();
    assert_eq!(first.profile(), &LaunchProfile::default());
    wait_for_predicate(|| first.is_closed(), Duration::from_secs(1))
        .await
        .expect("retired after its third page");

    let page = resolver.new_page().await.expect("page");
    assert_eq!(engine.launch_count(), 2);
    assert_eq!(page.generation(), 2);
    let state = resolver.state().expect("state");
    assert_eq!(state.created_page_count, 1);
    assert!(!state.end_of_life);
    page.close().await.expect("close");
}

#[tokio::test]
async fn concurrent_renders_share_one_launch() {
    let engine = MemoryEngine::new().with_launch_delay(Duration::from_millis(100));
    let registry = registry_with(&engine, 10);

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            let resolver = registry
                .resolve("default", ResolveOptions::default())
                .await
                .expect("resolver");
            resolver.new_page().await
        }));
    }

    let mut pages = Vec::new();
    for task in tasks {
        pages.push(task.await.expect("join").expect("page"));
    }

    assert_eq!(engine.launch_count(), 1);
    assert_eq!(registry.len(), 1);
    let snapshot = registry.snapshot();
    assert_eq!(snapshot[0].phase, ResolverPhase::Ready);
    assert_eq!(
        snapshot[0].state.expect("state").active_page_count,
        5,
        "every page counted once"
    );

    for page in pages {
        page.close().await.expect("close");
    }
    assert_eq!(registry.sweep().await, 1);
    assert!(engine.processes()[0].is_closed());
}

#[tokio::test]
async fn isolated_sessions_get_their_own_process() {
    let engine = MemoryEngine::new();
    let registry = registry_with(&engine, 10);

    let shared = registry
        .resolve("default", ResolveOptions::default())
        .await
        .expect("resolver");
    let shared_page = shared.new_page().await.expect("page");

    let isolated = registry
        .resolve("default", ResolveOptions::isolated())
        .await
        .expect("resolver");
    let isolated_page = isolated.new_page().await.expect("page");

    assert_eq!(engine.launch_count(), 2);
    assert_eq!(registry.len(), 2);
    assert_ne!(shared_page.pool_key(), isolated_page.pool_key());
    assert!(
        shared.state().expect("state").end_of_life,
        "busy resolver retires when swept"
    );

    isolated_page.close().await.expect("close");
    shared_page.close().await.expect("close");
    assert_eq!(registry.sweep().await, 2);
    assert!(registry.is_empty());
    assert!(engine.processes().iter().all(|process| process.is_closed()));
}

#[tokio::test]
async fn ignored_prefixes_do_not_hold_back_idle() {
    let engine = MemoryEngine::new();
    let registry = registry_with(&engine, 10);
    let resolver = registry
        .resolve("default", ResolveOptions::default())
        .await
        .expect("resolver");
    let page = resolver.new_page().await.expect("page");
    let emitter = engine
        .last_process()
        .and_then(|process| process.pages().last().cloned())
        .expect("memory page");

    let mut detector = NetworkQuiescenceDetector::with_interceptor(
        &page,
        Arc::new(IgnoreUrlPrefixes::new(["https://poll.example/"])),
    );
    emitter.emit(NetworkEvent::Request(NetworkRequest::new(
        "long-poll",
        "https://poll.example/stream",
        ResourceType::Xhr,
    )));
    emitter.emit(NetworkEvent::Request(NetworkRequest::new(
        "tile",
        "https://tiles.example/1/2/3.png",
        ResourceType::Image,
    )));
    emitter.emit(NetworkEvent::Failed {
        id: RequestId::new("tile"),
        error: "net::ERR_CONNECTION_RESET".to_string(),
    });

    tokio::time::timeout(Duration::from_secs(1), detector.wait_for_idle())
        .await
        .expect("idle despite the open long-poll");
    assert!(detector.has_failed_requests());
    assert_eq!(
        detector.failed_request_urls(),
        vec!["https://tiles.example/1/2/3.png".to_string()]
    );

    detector.dispose();
    page.close().await.expect("close");
}
