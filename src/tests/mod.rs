// Scenario tests for the station link and the OTA updater

#[cfg(test)]
mod connection_tests;


#[cfg(test)]
mod config_flow_tests;
