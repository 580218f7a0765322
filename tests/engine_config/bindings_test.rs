//! Module strategy persistence and pending/active reporting.

use std::sync::Arc;

use hymoctl::engine_config::bindings::{BindingStore, ModuleBinding, MountStrategy};
use hymoctl::engine_config::ConfigError;
use hymoctl::executor::CommandExecutor;
use hymoctl::privilege::PrivilegeTier;

use crate::fake_engine::{channel, FakeEngine};

async fn bindings(engine: &Arc<FakeEngine>, path: &std::path::Path) -> BindingStore {
    let channel = channel(engine);
    let connection = match channel.connect().await {
        Ok(c) => c,
        Err(e) => panic!("connect: {e}"),
    };
    BindingStore::new(path).with_engine(connection, CommandExecutor::new(channel))
}

fn tempdir() -> tempfile::TempDir {
    match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("tempdir: {e}"),
    }
}

#[tokio::test]
async fn hymofs_rejected_without_engine_access() {
    let dir = tempdir();
    let path = dir.path().join("module_mode.toml");
    let engine = Arc::new(FakeEngine::new(PrivilegeTier::Root));
    let store = bindings(&engine, &path).await;

    assert!(!store.allowed().contains(&MountStrategy::Hymofs));
    let result = store
        .set(ModuleBinding {
            module_id: "fonts".to_owned(),
            strategy: MountStrategy::Hymofs,
        })
        .await;
    assert!(matches!(result, Err(ConfigError::Gated { .. })));
    assert!(!path.exists());
}

#[tokio::test]
async fn declared_strategy_is_pending_until_restart() {
    let dir = tempdir();
    let path = dir.path().join("module_mode.toml");
    let engine = Arc::new(FakeEngine::new(PrivilegeTier::Kernel).with_modules("fonts overlay\nzygisk magic\n"));
    let store = bindings(&engine, &path).await;

    let view = match store
        .set(ModuleBinding {
            module_id: "fonts".to_owned(),
            strategy: MountStrategy::Hymofs,
        })
        .await
    {
        Ok(view) => view,
        Err(e) => panic!("set: {e}"),
    };
    assert_eq!(view.pending, Some(MountStrategy::Hymofs));
    assert_eq!(view.active, Some(MountStrategy::Overlay));
    assert!(view.needs_restart);

    let views = store.views().await;
    assert_eq!(views.len(), 2);
    let zygisk = match views.iter().find(|v| v.module_id == "zygisk") {
        Some(v) => v,
        None => panic!("zygisk missing from {views:?}"),
    };
    assert_eq!(zygisk.pending, None);
    assert!(!zygisk.needs_restart);
}

#[tokio::test]
async fn strategies_survive_reload() {
    let dir = tempdir();
    let path = dir.path().join("module_mode.toml");
    let store = BindingStore::new(&path);

    for (id, strategy) in [("a", MountStrategy::Magic), ("b", MountStrategy::None)] {
        if let Err(e) = store
            .set(ModuleBinding {
                module_id: id.to_owned(),
                strategy,
            })
            .await
        {
            panic!("set {id}: {e}");
        }
    }
    let pending = BindingStore::new(&path).pending().await;
    assert_eq!(pending.get("a"), Some(&MountStrategy::Magic));
    assert_eq!(pending.get("b"), Some(&MountStrategy::None));
}

#[tokio::test]
async fn bad_module_id_is_invalid() {
    let dir = tempdir();
    let store = BindingStore::new(dir.path().join("module_mode.toml"));
    let result = store
        .set(ModuleBinding {
            module_id: "../../etc".to_owned(),
            strategy: MountStrategy::Auto,
        })
        .await;
    assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
}

#[tokio::test]
async fn concurrent_sets_keep_every_module() {
    let dir = tempdir();
    let store = BindingStore::new(dir.path().join("module_mode.toml"));

    let mut handles = Vec::new();
    for n in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .set(ModuleBinding {
                    module_id: format!("mod{n}"),
                    strategy: MountStrategy::Magic,
                })
                .await
        }));
    }
    for handle in handles {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => panic!("set: {e}"),
            Err(e) => panic!("task panicked: {e}"),
        }
    }
    assert_eq!(store.pending().await.len(), 8);
}

#[cfg(unix)]
#[tokio::test]
async fn module_modes_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir();
    let path = dir.path().join("module_mode.toml");
    if let Err(e) = BindingStore::new(&path)
        .set(ModuleBinding {
            module_id: "fonts".to_owned(),
            strategy: MountStrategy::Overlay,
        })
        .await
    {
        panic!("set: {e}");
    }
    let mode = match std::fs::metadata(&path) {
        Ok(meta) => meta.permissions().mode() & 0o777,
        Err(e) => panic!("metadata: {e}"),
    };
    assert_eq!(mode, 0o600);
}
