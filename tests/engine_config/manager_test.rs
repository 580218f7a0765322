//! ConfigManager persistence and gated side effects.

use std::path::Path;
use std::sync::Arc;

use hymoctl::engine_config::{ConfigError, ConfigManager, EngineConfig, Toggle};
use hymoctl::executor::CommandExecutor;
use hymoctl::privilege::PrivilegeTier;
use hymoctl::service::Command;

use crate::fake_engine::{channel, FakeEngine};

async fn manager(engine: &Arc<FakeEngine>, path: &Path) -> ConfigManager {
    let channel = channel(engine);
    let connection = match channel.connect().await {
        Ok(c) => c,
        Err(e) => panic!("connect: {e}"),
    };
    ConfigManager::new(path).with_engine(connection, CommandExecutor::new(channel))
}

fn tempdir() -> tempfile::TempDir {
    match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("tempdir: {e}"),
    }
}

#[tokio::test]
async fn missing_file_loads_defaults() {
    let dir = tempdir();
    let manager = ConfigManager::new(dir.path().join("config.toml"));
    assert_eq!(manager.load().await, EngineConfig::default());
}

#[tokio::test]
async fn malformed_file_loads_defaults() {
    let dir = tempdir();
    let path = dir.path().join("config.toml");
    if let Err(e) = std::fs::write(&path, "verbose = [not toml") {
        panic!("write: {e}");
    }
    assert_eq!(ConfigManager::new(&path).load().await, EngineConfig::default());
}

#[tokio::test]
async fn save_replaces_whole_document() {
    let dir = tempdir();
    let engine = Arc::new(FakeEngine::new(PrivilegeTier::Kernel));
    let manager = manager(&engine, &dir.path().join("config.toml")).await;

    let first = EngineConfig {
        verbose: true,
        force_ext4: true,
        ..EngineConfig::default()
    };
    if let Err(e) = manager.save(&first).await {
        panic!("save: {e}");
    }
    let second = EngineConfig {
        disable_umount: true,
        ..EngineConfig::default()
    };
    match manager.save(&second).await {
        Ok(report) => assert!(report.applied.is_empty()),
        Err(e) => panic!("save: {e}"),
    }
    assert_eq!(manager.load().await, second);
}

#[tokio::test]
async fn gated_toggle_at_shell_persists_and_reports_gated() {
    let dir = tempdir();
    let engine = Arc::new(FakeEngine::new(PrivilegeTier::Shell));
    let manager = manager(&engine, &dir.path().join("config.toml")).await;
    let before = engine.issued_count();

    let mut config = manager.load().await;
    Toggle::Stealth.set(&mut config, true);
    match manager.save(&config).await {
        Err(ConfigError::Gated { settings, required }) => {
            assert_eq!(settings, vec!["enable_stealth".to_owned()]);
            assert_eq!(required, PrivilegeTier::Kernel);
        }
        other => panic!("expected Gated, got {other:?}"),
    }

    assert!(manager.load().await.enable_stealth);
    assert_eq!(engine.issued_count(), before);
}

#[tokio::test]
async fn gated_toggle_offline_persists_and_reports_gated() {
    let dir = tempdir();
    let manager = ConfigManager::new(dir.path().join("config.toml"));
    let config = EngineConfig {
        enable_kernel_debug: true,
        ..EngineConfig::default()
    };
    assert!(matches!(
        manager.save(&config).await,
        Err(ConfigError::Gated { .. })
    ));
    assert!(manager.load().await.enable_kernel_debug);
}

#[tokio::test]
async fn gated_toggle_at_kernel_is_applied() {
    let dir = tempdir();
    let engine = Arc::new(FakeEngine::new(PrivilegeTier::Kernel));
    let manager = manager(&engine, &dir.path().join("config.toml")).await;

    let config = EngineConfig {
        enable_stealth: true,
        enable_nuke: true,
        ..EngineConfig::default()
    };
    match manager.save(&config).await {
        Ok(report) => {
            assert_eq!(report.applied, vec!["enable_stealth", "enable_nuke"]);
            assert!(report.deferred.is_empty());
        }
        Err(e) => panic!("save: {e}"),
    }
    assert_eq!(engine.stealth(), Some(true));
    assert!(engine.issued().contains(&Command::NukeExt4Sysfs));

    // Unchanged toggles are not re-applied.
    let issued = engine.issued_count();
    if let Err(e) = manager.save(&config).await {
        panic!("resave: {e}");
    }
    assert_eq!(engine.issued_count(), issued);
}

#[tokio::test]
async fn failed_side_effect_still_persists() {
    let dir = tempdir();
    let engine = Arc::new(FakeEngine::new(PrivilegeTier::Kernel));
    let manager = manager(&engine, &dir.path().join("config.toml")).await;
    engine.fail_command("set_debug", -1);

    let config = EngineConfig {
        enable_kernel_debug: true,
        ..EngineConfig::default()
    };
    match manager.save(&config).await {
        Ok(report) => {
            assert!(report.applied.is_empty());
            assert_eq!(report.deferred.len(), 1);
            assert_eq!(report.deferred[0].setting, "enable_kernel_debug");
        }
        Err(e) => panic!("save: {e}"),
    }
    assert!(manager.load().await.enable_kernel_debug);
}

#[tokio::test]
async fn unwritable_location_is_persist_failed() {
    let dir = tempdir();
    let blocker = dir.path().join("not_a_dir");
    if let Err(e) = std::fs::write(&blocker, "x") {
        panic!("write: {e}");
    }
    let manager = ConfigManager::new(blocker.join("config.toml"));

    match manager.save(&EngineConfig::default()).await {
        Err(ConfigError::PersistFailed(_)) => {}
        other => panic!("expected PersistFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn gated_toggle_is_applied_on_later_save_at_kernel() {
    let dir = tempdir();
    let path = dir.path().join("config.toml");
    let config = EngineConfig {
        enable_stealth: true,
        ..EngineConfig::default()
    };

    let shell = Arc::new(FakeEngine::new(PrivilegeTier::Shell));
    assert!(matches!(
        manager(&shell, &path).await.save(&config).await,
        Err(ConfigError::Gated { .. })
    ));
    assert!(!manager(&shell, &path).await.applied().await.enable_stealth);

    let kernel = Arc::new(FakeEngine::new(PrivilegeTier::Kernel));
    match manager(&kernel, &path).await.save(&config).await {
        Ok(report) => assert_eq!(report.applied, vec!["enable_stealth"]),
        Err(e) => panic!("save at kernel: {e}"),
    }
    assert_eq!(kernel.stealth(), Some(true));
    assert!(manager(&kernel, &path).await.applied().await.enable_stealth);
}

#[tokio::test]
async fn deferred_side_effect_is_retried_on_next_save() {
    let dir = tempdir();
    let engine = Arc::new(FakeEngine::new(PrivilegeTier::Kernel));
    let manager = manager(&engine, &dir.path().join("config.toml")).await;
    engine.fail_command("set_debug", -1);

    let config = EngineConfig {
        enable_kernel_debug: true,
        ..EngineConfig::default()
    };
    match manager.save(&config).await {
        Ok(report) => assert_eq!(report.deferred.len(), 1),
        Err(e) => panic!("save: {e}"),
    }

    engine.clear_failure("set_debug");
    match manager.save(&config).await {
        Ok(report) => {
            assert_eq!(report.applied, vec!["enable_kernel_debug"]);
            assert!(report.deferred.is_empty());
        }
        Err(e) => panic!("resave: {e}"),
    }
    assert_eq!(engine.count_of("set_debug"), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn saved_documents_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir();
    let engine = Arc::new(FakeEngine::new(PrivilegeTier::Kernel));
    let manager = manager(&engine, &dir.path().join("config.toml")).await;
    let config = EngineConfig {
        enable_stealth: true,
        ..EngineConfig::default()
    };
    if let Err(e) = manager.save(&config).await {
        panic!("save: {e}");
    }
    for path in [manager.path().to_path_buf(), manager.applied_path()] {
        let mode = match std::fs::metadata(&path) {
            Ok(meta) => meta.permissions().mode() & 0o777,
            Err(e) => panic!("metadata {}: {e}", path.display()),
        };
        assert_eq!(mode, 0o600, "{}", path.display());
    }
}

#[tokio::test]
async fn concurrent_saves_publish_a_whole_document() {
    let dir = tempdir();
    let path = dir.path().join("config.toml");

    let mut handles = Vec::new();
    for n in 0..8u8 {
        let manager = ConfigManager::new(&path);
        handles.push(tokio::spawn(async move {
            let config = EngineConfig {
                verbose: n % 2 == 0,
                force_ext4: n % 3 == 0,
                disable_umount: n > 3,
                ..EngineConfig::default()
            };
            let saved = manager.save(&config).await;
            saved.map(|_| config)
        }));
    }
    let mut written = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(config)) => written.push(config),
            Ok(Err(e)) => panic!("save: {e}"),
            Err(e) => panic!("task panicked: {e}"),
        }
    }

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) => panic!("read: {e}"),
    };
    let on_disk: EngineConfig = match toml::from_str(&raw) {
        Ok(c) => c,
        Err(e) => panic!("published document is torn: {e}"),
    };
    assert!(written.contains(&on_disk), "{on_disk:?} was never saved");
    let leftovers = match std::fs::read_dir(dir.path()) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count(),
        Err(e) => panic!("read_dir: {e}"),
    };
    assert_eq!(leftovers, 0);
}
