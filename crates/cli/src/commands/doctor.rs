use parley_core::config::{AppConfig, LlmProvider, LoadOptions};
use parley_db::{connect_with_settings, migrations};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\
                 \"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_reasoning_service(&config));
            checks.push(check_outbound_channel(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            let dependent = [
                "reasoning_service",
                "outbound_channel",
                "database_connectivity",
                "schema_migrations",
            ];
            for name in dependent {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status != CheckStatus::Fail)
        && checks.iter().any(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_reasoning_service(config: &AppConfig) -> DoctorCheck {
    let (status, details) = match config.llm.provider {
        LlmProvider::Disabled => (
            CheckStatus::Skipped,
            "reasoning disabled; only quick-parse and sub-flows will answer".to_string(),
        ),
        LlmProvider::Anthropic if config.llm.api_key.is_some() => {
            (CheckStatus::Pass, format!("anthropic model `{}` with api key set", config.llm.model))
        }
        LlmProvider::Anthropic => (CheckStatus::Fail, "anthropic selected without api key".into()),
    };
    DoctorCheck { name: "reasoning_service", status, details }
}

fn check_outbound_channel(config: &AppConfig) -> DoctorCheck {
    match &config.outbound.webhook_url {
        Some(url) => DoctorCheck {
            name: "outbound_channel",
            status: CheckStatus::Pass,
            details: format!("replies are posted to `{url}`"),
        },
        None => DoctorCheck {
            name: "outbound_channel",
            status: CheckStatus::Skipped,
            details: "no outbound webhook configured; replies are dropped".to_string(),
        },
    }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;

        let pending = migrations::pending(&pool).await;
        pool.close().await;
        Ok::<_, String>(pending)
    });

    let pending = match result {
        Ok(pending) => pending,
        Err(error) => {
            return vec![
                DoctorCheck {
                    name: "database_connectivity",
                    status: CheckStatus::Fail,
                    details: error,
                },
                DoctorCheck {
                    name: "schema_migrations",
                    status: CheckStatus::Skipped,
                    details: "skipped because the database is unreachable".to_string(),
                },
            ];
        }
    };

    let connectivity = DoctorCheck {
        name: "database_connectivity",
        status: CheckStatus::Pass,
        details: format!("connected using `{}`", config.database.url),
    };
    let schema = match pending {
        Ok(versions) if versions.is_empty() => DoctorCheck {
            name: "schema_migrations",
            status: CheckStatus::Pass,
            details: "schema is up to date".to_string(),
        },
        Ok(versions) => DoctorCheck {
            name: "schema_migrations",
            status: CheckStatus::Fail,
            details: format!(
                "{} pending migration(s) {versions:?}; run `parley migrate`",
                versions.len()
            ),
        },
        Err(error) => DoctorCheck {
            name: "schema_migrations",
            status: CheckStatus::Fail,
            details: format!("could not read migration history: {error}"),
        },
    };
    vec![connectivity, schema]
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
