//! List-chips command implementation

use espforge_core::ChipProfiles;

/// Print the chip profile table
pub fn list_chips(profiles: &ChipProfiles, filter: Option<&str>) {
    println!("Chip profiles:");
    println!();
    println!(
        "{:<12} {:>8} {:>6} {:>6} {:>6}  {}",
        "Chip", "Baud", "Mode", "Freq", "Size", "Aliases"
    );
    println!("{}", "-".repeat(60));

    for profile in profiles.iter() {
        if let Some(filter) = filter {
            if !profile.name.to_lowercase().contains(&filter.to_lowercase()) {
                continue;
            }
        }

        println!(
            "{:<12} {:>8} {:>6} {:>6} {:>6}  {}",
            profile.name,
            profile.baud,
            profile.flash_mode.to_string(),
            profile.flash_freq.to_string(),
            profile.flash_size.to_string(),
            profile.aliases.join(", ")
        );
    }
}
