use amlops_common::{BatchEndpoint, OnlineEndpoint};

pub fn print_online_endpoint(endpoint: &OnlineEndpoint) {
    println!("\n=== Online Endpoint '{}' ===", endpoint.name);
    println!("  {:<14} {}", "Auth mode", endpoint.auth_mode);
    println!(
        "  {:<14} {}",
        "Scoring URI",
        endpoint.scoring_uri.as_deref().unwrap_or("N/A")
    );
    if let Some(description) = &endpoint.description {
        println!("  {:<14} {}", "Description", description);
    }
    for (key, value) in &endpoint.tags {
        println!("  {:<14} {}={}", "Tag", key, value);
    }

    println!("\n[Traffic]");
    if endpoint.traffic.is_empty() {
        println!("  (No traffic routed)");
    } else {
        println!("  {:<20} {:>7}", "Deployment", "Percent");
        for (deployment, percent) in &endpoint.traffic {
            println!("  {:<20} {:>6}%", deployment, percent);
        }
    }
    println!();
}

pub fn print_batch_endpoint(endpoint: &BatchEndpoint) {
    println!("\n=== Batch Endpoint '{}' ===", endpoint.name);
    println!(
        "  {:<20} {}",
        "Auth mode",
        endpoint
            .auth_mode
            .map(|mode| mode.to_string())
            .unwrap_or_else(|| "service default".to_string())
    );
    println!(
        "  {:<20} {}",
        "Scoring URI",
        endpoint.scoring_uri.as_deref().unwrap_or("N/A")
    );
    println!(
        "  {:<20} {}",
        "Default deployment",
        endpoint.defaults.deployment_name.as_deref().unwrap_or("N/A")
    );
    println!();
}
