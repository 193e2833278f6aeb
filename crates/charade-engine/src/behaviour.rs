//! Response behaviour: the effective decision for answering one request.
//!
//! A `ReadWriteResponseBehaviour` is built per request — from the resource
//! configuration, or mutated by a script — then frozen into a
//! `ResponseBehaviour` before it reaches the response service, so
//! late-firing listeners cannot mutate it.

use crate::config::{PerformanceConfig, ResponseConfig};
use anyhow::bail;
use std::collections::HashMap;

pub const DEFAULT_STATUS_CODE: u16 = 200;

/// How the pipeline treats the behaviour once built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BehaviourType {
    /// Let the plugin fill in unset fields and render the body
    #[default]
    Default,
    /// Emit status and headers exactly as configured, with an empty body
    ShortCircuit,
}

/// Mutable behaviour under construction.
#[derive(Debug, Clone, Default)]
pub struct ReadWriteResponseBehaviour {
    behaviour_type: BehaviourType,
    status_code: Option<u16>,
    response_file: Option<String>,
    response_data: Option<String>,
    example_name: Option<String>,
    headers: HashMap<String, String>,
    template: bool,
    performance: Option<PerformanceConfig>,
    /// Set once a script has chosen default or short-circuit handling
    behaviour_configured: bool,
}

impl ReadWriteResponseBehaviour {
    pub fn with_status_code(&mut self, status_code: u16) -> &mut Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_file(&mut self, response_file: &str) -> &mut Self {
        self.response_file = Some(response_file.to_string());
        self
    }

    pub fn with_data(&mut self, response_data: &str) -> &mut Self {
        self.response_data = Some(response_data.to_string());
        self
    }

    pub fn with_example_name(&mut self, example_name: &str) -> &mut Self {
        self.example_name = Some(example_name.to_string());
        self
    }

    /// Respond with empty content, or no records.
    pub fn with_empty(&mut self) -> &mut Self {
        self.response_file = None;
        self
    }

    pub fn with_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
        self
    }

    pub fn with_template(&mut self, template: bool) -> &mut Self {
        self.template = template;
        self
    }

    pub fn with_performance(&mut self, performance: PerformanceConfig) -> &mut Self {
        self.performance = Some(performance);
        self
    }

    pub fn with_delay(&mut self, exact_delay_ms: u64) -> &mut Self {
        self.performance = Some(PerformanceConfig {
            exact_delay_ms: Some(exact_delay_ms),
            ..Default::default()
        });
        self
    }

    pub fn with_delay_range(&mut self, min_delay_ms: u64, max_delay_ms: u64) -> &mut Self {
        self.performance = Some(PerformanceConfig {
            min_delay_ms: Some(min_delay_ms),
            max_delay_ms: Some(max_delay_ms),
            ..Default::default()
        });
        self
    }

    /// Let the plugin's default handling fill in anything unset.
    pub fn using_default_behaviour(&mut self) -> anyhow::Result<&mut Self> {
        if self.behaviour_configured {
            bail!("response already handled");
        }
        self.behaviour_configured = true;
        self.behaviour_type = BehaviourType::Default;
        Ok(self)
    }

    /// Skip default handling: emit exactly what has been set, no body.
    pub fn skip_default_behaviour(&mut self) -> anyhow::Result<&mut Self> {
        if self.behaviour_configured {
            bail!("response already handled");
        }
        self.behaviour_configured = true;
        self.behaviour_type = BehaviourType::ShortCircuit;
        Ok(self)
    }

    pub fn behaviour_type(&self) -> BehaviourType {
        self.behaviour_type
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn response_data(&self) -> Option<&str> {
        self.response_data.as_deref()
    }

    /// Freeze into the read-only form consumed by the response service.
    pub fn build(self) -> ResponseBehaviour {
        ResponseBehaviour {
            behaviour_type: self.behaviour_type,
            status_code: self.status_code.unwrap_or(DEFAULT_STATUS_CODE),
            response_file: self.response_file,
            response_data: self.response_data,
            example_name: self.example_name,
            headers: self.headers,
            template: self.template,
            performance: self.performance,
        }
    }
}

/// Frozen behaviour; read-only from here on.
#[derive(Debug, Clone)]
pub struct ResponseBehaviour {
    behaviour_type: BehaviourType,
    status_code: u16,
    response_file: Option<String>,
    response_data: Option<String>,
    example_name: Option<String>,
    headers: HashMap<String, String>,
    template: bool,
    performance: Option<PerformanceConfig>,
}

impl ResponseBehaviour {
    pub fn behaviour_type(&self) -> BehaviourType {
        self.behaviour_type
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn response_file(&self) -> Option<&str> {
        self.response_file.as_deref()
    }

    pub fn response_data(&self) -> Option<&str> {
        self.response_data.as_deref()
    }

    pub fn example_name(&self) -> Option<&str> {
        self.example_name.as_deref()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn is_template(&self) -> bool {
        self.template
    }

    pub fn performance(&self) -> Option<&PerformanceConfig> {
        self.performance.as_ref()
    }
}

/// Builds behaviours from response configuration, and overlays
/// configuration onto behaviours a script left partially set.
pub struct BehaviourFactory;

impl BehaviourFactory {
    /// Copy the response configuration into a fresh behaviour.
    pub fn build(status_code: u16, config: &ResponseConfig) -> ReadWriteResponseBehaviour {
        let mut behaviour = ReadWriteResponseBehaviour::default();
        Self::populate(status_code, config, &mut behaviour);
        behaviour
    }

    /// Overlay configuration onto `behaviour`, filling only unset fields.
    /// Headers merge; values already present win.
    pub fn populate(
        status_code: u16,
        config: &ResponseConfig,
        behaviour: &mut ReadWriteResponseBehaviour,
    ) {
        if behaviour.status_code.is_none() {
            behaviour.status_code = Some(status_code);
        }
        if behaviour.response_file.is_none() {
            behaviour.response_file = config.file.clone();
        }
        if behaviour.response_data.is_none() {
            behaviour.response_data = config.data.clone();
        }
        if behaviour.example_name.is_none() {
            behaviour.example_name = config.example_name.clone();
        }
        for (name, value) in &config.headers {
            behaviour
                .headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        if config.template {
            behaviour.template = true;
        }
        if behaviour.performance.is_none() {
            behaviour.performance = config.performance.clone();
        }
    }

    /// Status code a resource's configuration selects.
    pub fn status_code_for(config: &ResponseConfig) -> u16 {
        config.status_code.unwrap_or(DEFAULT_STATUS_CODE)
    }
}
