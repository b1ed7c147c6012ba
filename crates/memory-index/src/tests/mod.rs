mod manager_scenarios;
mod support;
mod sync_scenarios;
