//! Worker type listing: `forgeflow agents`.

use console::style;

use forgeflow::patterns::AGENT_TYPES;
use forgeflow::util::truncate;
use forgeflow::workers::{capabilities, role_prompt};

pub fn cmd_agents() {
    println!();
    println!("{}", style("Worker types").bold());
    println!();
    for worker_type in AGENT_TYPES {
        println!(
            "  {:<28} {}",
            style(worker_type).cyan(),
            style(capabilities(worker_type).join(", ")).dim()
        );
        println!("  {:<28} {}", "", truncate(role_prompt(worker_type), 80));
    }
    println!();
    println!(
        "Label a child issue with one of these types to assign it; unlabelled issues are skipped."
    );
}
