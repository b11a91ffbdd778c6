//! Terminal rendering

use colored::Colorize;
use persona_core::evolution::{context_hint, rank_topics};
use persona_core::sync::{decode, SyncPhase, SyncStatus, SyncTransition};
use persona_core::types::now;
use persona_core::{Fingerprint, Profile, ProfilesConfig, SyncSettings};

pub fn success(message: &str) {
    println!("{} {}", "✔".green(), message);
}

pub fn failure(message: &str) {
    eprintln!("{} {}", "✘".red(), message);
}

pub fn print_profile_list(config: &ProfilesConfig) {
    if config.list.is_empty() {
        println!("No profiles. Run 'persona reset' to restore the defaults.");
        return;
    }
    for profile in &config.list {
        let marker = if config.active_profile_id.as_deref() == Some(profile.id.as_str()) {
            "*".green().bold()
        } else {
            " ".normal()
        };
        println!(
            "{} {:<24} {:<28} {} uses",
            marker,
            profile.id.cyan(),
            profile.name.bold(),
            profile.usage_count()
        );
    }
}

pub fn print_profile(profile: &Profile, active: bool) {
    let title = if active {
        format!("{} (active)", profile.name)
    } else {
        profile.name.clone()
    };
    println!("{}", title.bold());
    println!("  id:      {}", profile.id.cyan());
    println!("  persona: {}", profile.persona);
    println!("  tone:    {}", profile.tone);
    if !profile.style_guidelines.is_empty() {
        println!("  guidelines:");
        for guideline in &profile.style_guidelines {
            println!("    - {}", guideline);
        }
    }

    let evolving = &profile.evolving_profile;
    println!(
        "  usage:   {} (last {})",
        evolving.usage_count,
        evolving.last_updated.format("%Y-%m-%d %H:%M")
    );
    if !evolving.last_prompt.is_empty() {
        println!("  last prompt: {}", evolving.last_prompt.dimmed());
    }
    if let Some(hint) = context_hint(profile, 3, now()) {
        println!("  {}", hint);
    }
}

pub fn print_topics(profile: &Profile, k: usize) {
    let ranked = rank_topics(&profile.evolving_profile, now());
    if ranked.is_empty() {
        println!("{} has no topics yet", profile.name);
        return;
    }
    for scored in ranked.into_iter().take(k) {
        println!(
            "{:>6.3}  {:<24} {:>4}x  last {}",
            scored.score,
            scored.topic.name.bold(),
            scored.topic.count,
            scored.topic.last_used.format("%Y-%m-%d")
        );
    }
}

fn phase_label(phase: SyncPhase) -> colored::ColoredString {
    let label = phase.to_string();
    match phase {
        SyncPhase::Error => label.red().bold(),
        SyncPhase::Disabled => label.dimmed(),
        SyncPhase::Idle => label.green(),
        _ => label.yellow(),
    }
}

pub fn print_transition(transition: &SyncTransition) {
    let detail = transition.detail.as_deref().unwrap_or("");
    println!(
        "{} {} → {}  {}",
        transition.at.format("%H:%M:%S").to_string().dimmed(),
        phase_label(transition.from),
        phase_label(transition.to),
        detail
    );
}

pub async fn print_sync_status(settings: &SyncSettings, status: &SyncStatus) {
    println!("{}", "Sync".bold());
    println!("  document:  {}", settings.path.display());
    println!(
        "  auto sync: {}",
        if settings.enabled { "enabled".green() } else { "disabled".dimmed() }
    );
    println!(
        "  debounce:  {} ms, poll every {} ms",
        settings.debounce_ms, settings.poll_interval_ms
    );
    println!("  phase:     {}", phase_label(status.phase));

    match tokio::fs::read(&settings.path).await {
        Ok(bytes) => {
            let fingerprint = Fingerprint::of(&bytes);
            match decode(&bytes) {
                Ok(document) => println!(
                    "  contents:  {} profiles, {:?} format ({})",
                    document.config.list.len(),
                    document.format,
                    fingerprint.short()
                ),
                Err(e) => println!("  contents:  {} {}", "invalid:".red(), e),
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("  contents:  {}", "no document yet".dimmed())
        }
        Err(e) => println!("  contents:  {} {}", "unreadable:".red(), e),
    }
}
