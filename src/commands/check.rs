//! Parse a unit file and display its services

use std::path::Path;
use warden::units;

pub async fn check(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let specs = units::load_unit_file(path).await?;

    println!("SERVICE              RESTART         MEMORY      CPUS   IMAGE");
    for spec in &specs {
        let memory = spec
            .limits
            .memory_bytes
            .map(|b| format!("{}M", b / (1024 * 1024)))
            .unwrap_or_else(|| "-".to_string());
        let cpus = spec
            .limits
            .cpu_share
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<15} {:<11} {:<6} {}",
            spec.name,
            spec.restart.as_str(),
            memory,
            cpus,
            spec.image.as_deref().unwrap_or("-")
        );

        if spec.command.is_empty() {
            println!("  ! no command, cannot be started");
        } else {
            let command = shlex::try_join(spec.command.iter().map(String::as_str))
                .unwrap_or_else(|_| spec.command.join(" "));
            println!("  command: {}", command);
        }
        if let Some(env_file) = &spec.env_file {
            println!("  env_file: {}", env_file.display());
        }
        for mount in &spec.mounts {
            println!(
                "  mount: {} -> {}{}",
                mount.host.display(),
                mount.container.display(),
                if mount.read_only { " (ro)" } else { "" }
            );
        }
    }

    println!("\n{} services OK", specs.len());
    Ok(())
}
