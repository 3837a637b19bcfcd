use colored::*;
use keyscope_core::accumulator::PermissionStatus;
use keyscope_core::probe::RequestLogEntry;
use keyscope_core::{AnalysisOutcome, Resource, ScopeTable, ServiceDefinition};
use std::collections::BTreeMap;

/// Print the result of one analyzer run.
pub fn print_analysis(outcome: &AnalysisOutcome) {
    let result = &outcome.result;
    let metadata = &result.metadata;

    println!();
    println!(
        "{}",
        format!(
            " keyscope v{}: {} credential",
            env!("CARGO_PKG_VERSION"),
            result.analyzer_type
        )
        .bold()
    );
    println!();

    if let Some(user_id) = metadata.get("user_id") {
        println!(" {}", "Identity".bold().underline());
        println!(" {} id: {}", "|-".dimmed(), user_id.cyan());
        if let Some(name) = metadata.get("user_name") {
            println!(" {} name: {}", "|-".dimmed(), name);
        }
        if let Some(email) = metadata.get("user_email") {
            println!(" {} email: {}", "|-".dimmed(), email);
        }
        println!();
    }

    println!(" {}", "Scopes".bold().underline());
    let mut any_scope = false;
    for (key, status) in [
        ("granted_scopes", PermissionStatus::Granted),
        ("denied_scopes", PermissionStatus::Denied),
        ("unverified_scopes", PermissionStatus::Unverified),
    ] {
        for scope in scope_list(metadata, key) {
            any_scope = true;
            println!(" {} {}", status_tag(status), scope);
        }
    }
    if !any_scope {
        println!(" {}", "No scopes were checked.".dimmed());
    }
    println!();

    println!(" {}", "=".repeat(60).dimmed());
    println!();

    if result.bindings.is_empty() {
        println!(" {} No accessible resources found.", "--".dimmed());
    } else {
        println!(" {}", "Accessible Resources".bold().underline());
        let mut by_resource: BTreeMap<String, (&Resource, Vec<&str>)> = BTreeMap::new();
        for binding in &result.bindings {
            by_resource
                .entry(binding.resource.key().to_string())
                .or_insert_with(|| (&binding.resource, Vec::new()))
                .1
                .push(binding.permission.as_str());
        }
        for (resource, permissions) in by_resource.values() {
            print_resource(resource);
            println!("   {} {}", "|".dimmed(), permissions.join(", ").green());
        }
    }

    if !result.unbounded_resources.is_empty() {
        println!();
        println!(" {}", "Other Resources".bold().underline());
        for resource in &result.unbounded_resources {
            print_resource(resource);
        }
    }

    let failures = outcome.failures();
    if !failures.is_empty() {
        println!();
        println!(
            " {} {} check(s) could not be completed:",
            " WARN ".on_yellow().black().bold(),
            failures.len()
        );
        for failure in &failures {
            println!("   {} {}", "|".dimmed(), failure);
        }
    }
    println!();
}

fn print_resource(resource: &Resource) {
    let label = if resource.name == resource.id {
        resource.id.clone()
    } else {
        format!("{} ({})", resource.name, resource.id)
    };
    println!(" {} {}", format!("[{}]", resource.resource_type).cyan(), label.bold());
    if let Some(parent) = &resource.parent {
        println!("   {} parent: {}", "|".dimmed(), parent);
    }
    for (key, value) in &resource.metadata {
        println!("   {} {}: {}", "|".dimmed(), key.dimmed(), value);
    }
}

fn scope_list<'a>(metadata: &'a BTreeMap<String, String>, key: &str) -> Vec<&'a str> {
    metadata
        .get(key)
        .map(|joined| joined.split(',').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn status_tag(status: PermissionStatus) -> String {
    let tag = format!(" {:<10} ", status.symbol());
    match status {
        PermissionStatus::Granted => tag.on_green().black().bold().to_string(),
        PermissionStatus::Denied => tag.on_red().white().bold().to_string(),
        PermissionStatus::Unverified => tag.dimmed().to_string(),
    }
}

/// Print the scope table of a service definition.
pub fn print_scope_table(definition: &ServiceDefinition, table: &ScopeTable) {
    println!();
    println!("{}", format!(" {} scopes", definition.analyzer_type).bold());
    if let Some(description) = &definition.description {
        println!(" {}", description.dimmed());
    }
    println!();

    for stage in table.stages() {
        println!(" {}", format!("Stage {}", stage).bold().underline());
        for test in table.tests_in_stage(stage) {
            println!(
                " {} {} {}",
                test.name.green(),
                test.test.method.as_str().cyan(),
                test.test.endpoint
            );
            if !test.implied_scopes.is_empty() {
                println!("   {} implies: {}", "|".dimmed(), test.implied_scopes.join(", "));
            }
            if let Some(for_each) = &test.for_each {
                println!("   {} for each: {}", "|".dimmed(), for_each);
            }
            if !test.skip_if_granted.is_empty() {
                println!(
                    "   {} skipped when granted: {}",
                    "|".dimmed(),
                    test.skip_if_granted.join(", ")
                );
            }
            if let Some(mapping) = &test.resources {
                println!("   {} lists: {}", "|".dimmed(), mapping.resource_type);
            }
        }
        println!();
    }

    let untested: Vec<&str> = table
        .scopes()
        .iter()
        .filter(|scope| !table.tests().iter().any(|t| &t.name == *scope))
        .map(String::as_str)
        .collect();
    if !untested.is_empty() {
        println!(
            " {} Not probed directly: {}",
            "--".dimmed(),
            untested.join(", ")
        );
        println!();
    }
}

/// Print a one-line summary per service.
pub fn print_service_list(services: &[(String, Result<ServiceDefinition, String>)]) {
    println!();
    println!(" {}", "Services".bold().underline());
    for (source, service) in services {
        match service {
            Ok(definition) => println!(
                " {} {:<12} {}",
                "OK".green().bold(),
                definition.analyzer_type,
                definition
                    .description
                    .as_deref()
                    .unwrap_or(source.as_str())
                    .dimmed()
            ),
            Err(error) => println!(" {} {} {}", "ERR".red().bold(), source, error),
        }
    }
    println!();
}

/// Print the summary of a valid service definition.
pub fn print_validation(source: &str, definition: &ServiceDefinition, table: &ScopeTable) {
    println!(
        " {} {} is a valid definition for '{}'",
        "OK".green().bold(),
        source,
        definition.analyzer_type
    );
    println!(
        "   {} {} scope(s), {} test(s), {} stage(s)",
        "|".dimmed(),
        table.scopes().len(),
        table.tests().len(),
        table.stages().len()
    );
    let fields: Vec<String> = definition.credential_fields().into_iter().collect();
    println!("   {} credential fields: {}", "|".dimmed(), fields.join(", "));
    println!(
        "   {} identity check: {}",
        "|".dimmed(),
        definition
            .identity
            .as_ref()
            .map(|i| format!("{} {}", i.test.method, i.test.endpoint))
            .unwrap_or_else(|| "none".to_string())
    );
}

/// Print the request log collected during a run.
pub fn print_request_log(entries: &[RequestLogEntry]) {
    println!(" {}", "Request Log".bold().underline());
    for entry in entries {
        let status = match entry.status {
            Some(code) if code < 400 => code.to_string().green().to_string(),
            Some(code) => code.to_string().yellow().to_string(),
            None => "ERR".red().to_string(),
        };
        println!(
            " {} {:<6} {} {} {}",
            entry.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
            entry.method.as_str(),
            status,
            entry.path,
            format!("({} ms)", entry.elapsed_ms).dimmed()
        );
    }
    println!();
}
