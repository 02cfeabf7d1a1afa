//! Pre-authorizes privacy permissions in a simulator so that first-run
//! permission dialogs never block an unattended run.
//!
//! The permission store (TCC.db) changed layout several times. Older layouts
//! are patched with SQL; newer simulators are granted permissions through
//! `simctl privacy`.

use crate::core::error::{Error, Result};
use crate::logs::Log;
use crate::process::{ExecutionResult, OutputSinks, ProcessCommand, ProcessManager};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const SERVICES: &[&str] = &[
    "kTCCServiceAll",
    "kTCCServiceAddressBook",
    "kTCCServiceCalendar",
    "kTCCServiceCamera",
    "kTCCServicePhotos",
    "kTCCServiceMediaLibrary",
    "kTCCServiceMicrophone",
    "kTCCServiceUbiquity",
    "kTCCServiceWillow",
];

const SQLITE: &str = "/usr/bin/sqlite3";

/// Records granted through `simctl privacy` with the same reason code as an
/// interactive grant; some simulator builds ignore the tool's own code.
const AUTH_REASON_TRIGGER: &str = "\nCREATE TRIGGER auth_method_update AFTER INSERT ON access FOR EACH ROW WHEN new.auth_reason = 4 BEGIN UPDATE access SET auth_reason = 2 WHERE client=new.client;END;";

/// Permission store generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TccSchema {
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
    V5 = 5,
}

impl TccSchema {
    fn uses_simctl(self) -> bool {
        self >= TccSchema::V4
    }
}

/// Schema generation for a simulator runtime identifier.
pub fn schema_version(sim_runtime: &str) -> Result<TccSchema> {
    use TccSchema::*;

    let major = |prefix: &str| -> Option<Result<u64>> {
        let rest = sim_runtime.strip_prefix(prefix)?;
        Some(
            rest.split('-')
                .next()
                .and_then(|m| m.parse().ok())
                .ok_or_else(|| Error::config(format!("invalid runtime version in '{}'", sim_runtime))),
        )
    };

    if let Some(v) = major("com.apple.CoreSimulator.SimRuntime.iOS-") {
        return Ok(match v? {
            17.. => V5,
            14.. => V4,
            12.. => V3,
            9.. => V2,
            _ => V1,
        });
    }
    if let Some(v) = major("com.apple.CoreSimulator.SimRuntime.tvOS-") {
        return Ok(match v? {
            17.. => V5,
            14.. => V4,
            12.. => V3,
            _ => V2,
        });
    }
    if let Some(v) = major("com.apple.CoreSimulator.SimRuntime.watchOS-") {
        return Ok(match v? {
            10.. => V5,
            7.. => V4,
            5.. => V3,
            _ => V2,
        });
    }
    if sim_runtime.starts_with("com.apple.CoreSimulator.SimRuntime.xrOS-") {
        return Ok(V5);
    }
    Err(Error::unsupported(format!(
        "no permission store layout known for runtime '{}'",
        sim_runtime
    )))
}

/// SQL granting every service to `clients` for schemas 1 to 3.
pub fn patch_sql(schema: TccSchema, clients: &[String], now: i64) -> Result<String> {
    let mut sql = String::from("\n");
    for client in clients {
        for service in SERVICES {
            match schema {
                TccSchema::V1 => {
                    sql.push_str(&format!(
                        "DELETE FROM access WHERE service = '{service}' AND client = '{client}';\n"
                    ));
                    sql.push_str(&format!(
                        "INSERT INTO access VALUES('{service}','{client}',0,1,0,NULL);\n"
                    ));
                }
                TccSchema::V2 => {
                    sql.push_str(&format!(
                        "DELETE FROM access WHERE service = '{service}' AND client = '{client}';\n"
                    ));
                    sql.push_str(&format!(
                        "INSERT INTO access VALUES('{service}','{client}',0,1,0,NULL,NULL);\n"
                    ));
                }
                TccSchema::V3 => {
                    sql.push_str(&format!(
                        "INSERT OR REPLACE INTO access VALUES('{service}','{client}',0,1,0,NULL,NULL,NULL,'UNUSED',NULL,NULL,{now});\n"
                    ));
                }
                TccSchema::V4 | TccSchema::V5 => {
                    return Err(Error::unsupported("schema is patched through simctl"));
                }
            }
        }
    }
    Ok(sql)
}

/// Grants permissions inside a simulator.
pub struct TccAuthorizer {
    processes: Arc<dyn ProcessManager>,
    retry_budget: Duration,
}

impl TccAuthorizer {
    pub fn new(processes: Arc<dyn ProcessManager>) -> Self {
        Self {
            processes,
            retry_budget: Duration::from_secs(3),
        }
    }

    /// How long SQL patching keeps retrying.
    pub fn with_retry_budget(mut self, budget: Duration) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Authorize every known service for each bundle id and its watch app.
    ///
    /// Returns `false` when the store could not be edited, for whatever
    /// reason; the run can still go ahead, it just may hang on a permission
    /// dialog.
    pub async fn authorize(
        &self,
        sim_runtime: &str,
        database: &Path,
        udid: &str,
        bundle_ids: &[String],
        log: &Log,
        cancel: &CancellationToken,
    ) -> bool {
        if bundle_ids.is_empty() {
            log.write_line("No bundle identifiers given when requested permission editing.");
            return false;
        }

        let edited = match self.edit(sim_runtime, database, udid, bundle_ids, log, cancel).await {
            Ok(edited) => edited,
            Err(e) => {
                tracing::warn!(runtime = %sim_runtime, error = %e, "permission editing failed");
                log.write_line(format!("Failed to edit TCC.db: {}", e));
                false
            }
        };

        if edited {
            log.write_line("Successfully edited TCC.db");
        } else {
            log.write_line(
                "Failed to edit TCC.db, the test run might hang due to permission request dialogs",
            );
        }

        log.write_line("Current TCC database contents:");
        if let Err(e) = self
            .sqlite(database, ".dump", Duration::from_secs(5), log, cancel)
            .await
        {
            tracing::warn!(error = %e, "could not dump TCC.db");
            log.write_line(format!("Failed to dump TCC.db: {}", e));
        }

        edited
    }

    async fn edit(
        &self,
        sim_runtime: &str,
        database: &Path,
        udid: &str,
        bundle_ids: &[String],
        log: &Log,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let schema = schema_version(sim_runtime)?;
        tracing::debug!(runtime = %sim_runtime, ?schema, "authorizing permissions");

        if schema.uses_simctl() {
            self.grant_with_simctl(schema, database, udid, bundle_ids, log, cancel).await
        } else {
            self.patch_with_sql(schema, database, bundle_ids, log, cancel).await
        }
    }

    async fn grant_with_simctl(
        &self,
        schema: TccSchema,
        database: &Path,
        udid: &str,
        bundle_ids: &[String],
        log: &Log,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if schema >= TccSchema::V5 {
            let rv = self
                .sqlite(database, AUTH_REASON_TRIGGER, Duration::from_secs(60), log, cancel)
                .await?;
            if !rv.succeeded() {
                log.write_line("Failed to create trigger on TCC.db, some tests might timeout.");
            }
        }

        // Fails when the simulator is already booted.
        self.processes
            .execute_xcode_command(
                vec!["simctl".into(), "boot".into(), udid.into()],
                log,
                Duration::from_secs(60),
                cancel.clone(),
            )
            .await?;

        for client in clients(bundle_ids) {
            for service in SERVICES {
                let args = vec![
                    "simctl".to_string(),
                    "privacy".into(),
                    udid.into(),
                    "grant".into(),
                    service.to_string(),
                    client.clone(),
                ];
                let rv = self
                    .processes
                    .execute_xcode_command(args, log, Duration::from_secs(30), cancel.clone())
                    .await?;
                if !rv.succeeded() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn patch_with_sql(
        &self,
        schema: TccSchema,
        database: &Path,
        bundle_ids: &[String],
        log: &Log,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let started = Instant::now();
        loop {
            let mut failure = false;
            for bundle_id in bundle_ids {
                let ids = [bundle_id.clone(), format!("{}.watchkitapp", bundle_id)];
                let sql = patch_sql(schema, &ids, chrono::Utc::now().timestamp())?;
                let rv = self
                    .sqlite(database, &sql, Duration::from_secs(5), log, cancel)
                    .await?;
                if !rv.succeeded() {
                    failure = true;
                    break;
                }
            }

            if !failure {
                return Ok(true);
            }
            if started.elapsed() > self.retry_budget || cancel.is_cancelled() {
                return Ok(false);
            }
            log.write_line("Failed to edit TCC.db, trying again in 1 second... ");
            tokio::time::sleep(Duration::from_secs(1).min(self.retry_budget)).await;
        }
    }

    async fn sqlite(
        &self,
        database: &Path,
        statement: &str,
        timeout: Duration,
        log: &Log,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let command = ProcessCommand::new(SQLITE)
            .arg(database.display().to_string())
            .arg(statement)
            .timeout(timeout);
        self.processes
            .execute(command, OutputSinks::single(log), cancel.clone())
            .await
    }
}

fn clients(bundle_ids: &[String]) -> Vec<String> {
    bundle_ids
        .iter()
        .flat_map(|id| [id.clone(), format!("{}.watchkitapp", id)])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeProcessManager;

    #[test]
    fn test_schema_table() {
        let cases = [
            ("com.apple.CoreSimulator.SimRuntime.iOS-8-4", TccSchema::V1),
            ("com.apple.CoreSimulator.SimRuntime.iOS-9-0", TccSchema::V2),
            ("com.apple.CoreSimulator.SimRuntime.iOS-12-4", TccSchema::V3),
            ("com.apple.CoreSimulator.SimRuntime.iOS-14-0", TccSchema::V4),
            ("com.apple.CoreSimulator.SimRuntime.iOS-17-2", TccSchema::V5),
            ("com.apple.CoreSimulator.SimRuntime.tvOS-11-0", TccSchema::V2),
            ("com.apple.CoreSimulator.SimRuntime.tvOS-16-0", TccSchema::V4),
            ("com.apple.CoreSimulator.SimRuntime.watchOS-4-2", TccSchema::V2),
            ("com.apple.CoreSimulator.SimRuntime.watchOS-6-0", TccSchema::V3),
            ("com.apple.CoreSimulator.SimRuntime.watchOS-9-0", TccSchema::V4),
            ("com.apple.CoreSimulator.SimRuntime.watchOS-10-0", TccSchema::V5),
            ("com.apple.CoreSimulator.SimRuntime.xrOS-1-0", TccSchema::V5),
        ];
        for (runtime, expected) in cases {
            assert_eq!(schema_version(runtime).unwrap(), expected, "{}", runtime);
        }
        assert!(schema_version("com.apple.CoreSimulator.SimRuntime.macOS-14-0").is_err());
        assert!(schema_version("com.apple.CoreSimulator.SimRuntime.iOS-x").is_err());
    }

    #[test]
    fn test_patch_sql_layouts() {
        let ids = vec!["com.example.app".to_string()];
        let v1 = patch_sql(TccSchema::V1, &ids, 0).unwrap();
        assert!(v1.contains("INSERT INTO access VALUES('kTCCServiceAll','com.example.app',0,1,0,NULL);"));
        assert!(v1.contains("DELETE FROM access WHERE service = 'kTCCServiceCamera'"));

        let v2 = patch_sql(TccSchema::V2, &ids, 0).unwrap();
        assert!(v2.contains("0,1,0,NULL,NULL);"));

        let v3 = patch_sql(TccSchema::V3, &ids, 1700000000).unwrap();
        assert!(v3.contains("'UNUSED',NULL,NULL,1700000000);"));
        assert_eq!(v3.matches("INSERT OR REPLACE").count(), SERVICES.len());

        assert!(patch_sql(TccSchema::V4, &ids, 0).is_err());
    }

    #[tokio::test]
    async fn test_no_bundle_ids_is_false() {
        let pm = Arc::new(FakeProcessManager::always(ExecutionResult::success()));
        let ok = TccAuthorizer::new(pm.clone())
            .authorize(
                "com.apple.CoreSimulator.SimRuntime.iOS-17-0",
                Path::new("/tmp/TCC.db"),
                "UDID",
                &[],
                &Log::memory(),
                &CancellationToken::new(),
            )
            .await;
        assert!(!ok);
        assert!(pm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_newest_schema_installs_trigger_then_grants() {
        let pm = Arc::new(FakeProcessManager::always(ExecutionResult::success()));
        let ok = TccAuthorizer::new(pm.clone())
            .authorize(
                "com.apple.CoreSimulator.SimRuntime.iOS-17-0",
                Path::new("/sims/TCC.db"),
                "UDID",
                &["com.example.app".to_string()],
                &Log::memory(),
                &CancellationToken::new(),
            )
            .await;
        assert!(ok);

        let calls = pm.calls();
        assert_eq!(calls[0].name(), "sqlite3");
        assert!(calls[0].args[1].contains("CREATE TRIGGER auth_method_update"));
        assert_eq!(calls[1].args, vec!["simctl", "boot", "UDID"]);
        let grants: Vec<_> = calls
            .iter()
            .filter(|c| c.args.get(1).map(String::as_str) == Some("privacy"))
            .collect();
        assert_eq!(grants.len(), 2 * SERVICES.len());
        assert!(grants.iter().any(|c| c.args[5] == "com.example.app.watchkitapp"));
        assert_eq!(calls.last().unwrap().args[1], ".dump");
    }

    #[tokio::test]
    async fn test_schema_four_skips_trigger_and_stops_at_first_failure() {
        let pm = Arc::new(FakeProcessManager::sync(|cmd, _| {
            if cmd.args.get(1).map(String::as_str) == Some("privacy") {
                ExecutionResult::failed(1)
            } else {
                ExecutionResult::success()
            }
        }));
        let log = Log::memory();
        let ok = TccAuthorizer::new(pm.clone())
            .authorize(
                "com.apple.CoreSimulator.SimRuntime.iOS-15-0",
                Path::new("/sims/TCC.db"),
                "UDID",
                &["a".to_string(), "b".to_string()],
                &log,
                &CancellationToken::new(),
            )
            .await;
        assert!(!ok);
        let lines = pm.command_lines();
        assert!(!lines.iter().any(|l| l.contains("CREATE TRIGGER")));
        assert_eq!(lines.iter().filter(|l| l.contains("privacy")).count(), 1);
        assert!(log.contents().unwrap().contains("might hang due to permission request dialogs"));
    }

    #[tokio::test]
    async fn test_sql_patch_retries_within_budget() {
        let pm = Arc::new(FakeProcessManager::sync(|cmd, _| {
            if cmd.args.get(1).map(String::as_str) == Some(".dump") {
                ExecutionResult::success()
            } else {
                ExecutionResult::failed(1)
            }
        }));
        let ok = TccAuthorizer::new(pm.clone())
            .with_retry_budget(Duration::from_millis(50))
            .authorize(
                "com.apple.CoreSimulator.SimRuntime.iOS-12-0",
                Path::new("/sims/TCC.db"),
                "UDID",
                &["com.example.app".to_string()],
                &Log::memory(),
                &CancellationToken::new(),
            )
            .await;
        assert!(!ok);
        let patches = pm
            .calls()
            .iter()
            .filter(|c| c.args.get(1).is_some_and(|a| a.contains("INSERT OR REPLACE")))
            .count();
        assert!(patches >= 2, "expected a retry, got {} attempts", patches);
    }

    #[tokio::test]
    async fn test_sql_patch_covers_watch_app() {
        let pm = Arc::new(FakeProcessManager::always(ExecutionResult::success()));
        TccAuthorizer::new(pm.clone())
            .authorize(
                "com.apple.CoreSimulator.SimRuntime.iOS-10-0",
                Path::new("/sims/TCC.db"),
                "UDID",
                &["com.example.app".to_string()],
                &Log::memory(),
                &CancellationToken::new(),
            )
            .await;
        let first = &pm.calls()[0];
        assert!(first.args[1].contains("'com.example.app.watchkitapp'"));
    }

    #[tokio::test]
    async fn test_missing_sqlite_is_false_not_error() {
        let pm = Arc::new(
            FakeProcessManager::always(ExecutionResult::success()).failing_spawn(|cmd| cmd.name() == "sqlite3"),
        );
        let log = Log::memory();
        let ok = TccAuthorizer::new(pm.clone())
            .with_retry_budget(Duration::ZERO)
            .authorize(
                "com.apple.CoreSimulator.SimRuntime.iOS-12-0",
                Path::new("/sims/TCC.db"),
                "UDID",
                &["com.example.app".to_string()],
                &log,
                &CancellationToken::new(),
            )
            .await;
        assert!(!ok);
        let text = log.contents().unwrap();
        assert!(text.contains("failed to spawn sqlite3"), "{}", text);
        assert!(text.contains("Failed to dump TCC.db"));
    }

    #[tokio::test]
    async fn test_unknown_runtime_is_false_not_error() {
        let pm = Arc::new(FakeProcessManager::always(ExecutionResult::success()));
        let ok = TccAuthorizer::new(pm.clone())
            .authorize(
                "com.apple.CoreSimulator.SimRuntime.PalmOS-5-0",
                Path::new("/sims/TCC.db"),
                "UDID",
                &["com.example.app".to_string()],
                &Log::memory(),
                &CancellationToken::new(),
            )
            .await;
        assert!(!ok);
        // Only the dump ran.
        assert_eq!(pm.calls().len(), 1);
        assert_eq!(pm.calls()[0].args[1], ".dump");
    }
}
