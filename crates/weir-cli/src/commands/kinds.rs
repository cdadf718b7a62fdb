//! List built-in module kinds.

use weir_config::MODULE_KINDS;

/// Run the kinds command.
pub fn run() -> anyhow::Result<()> {
    println!("Built-in Module Kinds");
    println!("=====================\n");
    println!("{:<12} {:>3} {:>4}  DESCRIPTION", "KIND", "IN", "OUT");
    println!("{}", "-".repeat(72));
    for kind in MODULE_KINDS {
        println!(
            "{:<12} {:>3} {:>4}  {}",
            kind.name, kind.default_inputs, kind.default_outputs, kind.description
        );
    }
    Ok(())
}
