use parley_core::domain::session::WorkspaceId;
use parley_db::repositories::{CatalogRepository, SqlCatalogRepository};
use parley_db::DemoCatalog;

use crate::commands::{with_database, CommandResult};

/// Loads the demo catalog into `workspace`. Safe to re-run.
pub fn run(workspace: &str) -> CommandResult {
    let workspace_id = WorkspaceId(workspace.to_string());

    with_database("seed", |_, pool| async move {
        let repository = SqlCatalogRepository::new(pool);
        let seeded = DemoCatalog::load(&repository, &workspace_id)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 6u8))?;

        let stored = repository
            .snapshot(&workspace_id)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 7u8))?;
        let names = stored.iter().map(|product| product.name.clone()).collect::<Vec<_>>();

        verify(seeded.products_loaded, &names)
            .map_err(|message| ("seed_verification", message, 7u8))?;
        Ok(summary(&workspace_id.0, &names))
    })
}

fn verify(expected: usize, stored: &[String]) -> Result<(), String> {
    if stored.len() < expected {
        return Err(format!(
            "catalog holds {} products after seeding, expected at least {expected}",
            stored.len()
        ));
    }
    Ok(())
}

fn summary(workspace: &str, names: &[String]) -> String {
    let mut sorted = names.to_vec();
    sorted.sort();
    let lines = sorted.iter().map(|name| format!("  - {name}")).collect::<Vec<_>>();
    format!(
        "demo catalog loaded into workspace `{workspace}` ({} products):\n{}",
        names.len(),
        lines.join("\n")
    )
}
