//! Static checks on a rollout spec, run before any side effect.

use stride_state::RolloutPluginSpec;

/// Check `spec`; the error is a human-readable reason.
///
/// Pause durations are not parsed here; a bad duration fails the rollout
/// when its step is reached.
pub fn validate_spec(spec: &RolloutPluginSpec) -> Result<(), String> {
    if spec.plugin.trim().is_empty() {
        return Err("spec.plugin must name a resource plugin".to_string());
    }
    if spec.workload_ref.kind.trim().is_empty() {
        return Err("spec.workloadRef.kind must be set".to_string());
    }
    if spec.workload_ref.name.trim().is_empty() {
        return Err("spec.workloadRef.name must be set".to_string());
    }

    let steps = &spec.strategy.steps;
    for (index, step) in steps.iter().enumerate() {
        if step.action_count() > 1 {
            return Err(format!(
                "step {index} sets more than one of setWeight, analysis, pause"
            ));
        }
        if let Some(weight) = step.set_weight
            && weight > 100
        {
            return Err(format!("step {index} weight {weight} is not within 0-100"));
        }
        if let Some(analysis) = &step.analysis {
            if analysis.templates.is_empty() {
                return Err(format!("step {index} analysis names no templates"));
            }
            if analysis.templates.iter().any(|t| t.template_name.trim().is_empty()) {
                return Err(format!("step {index} analysis has a template with no name"));
            }
        }
    }

    if let Some(background) = &spec.strategy.analysis {
        if background.templates.is_empty() {
            return Err("background analysis names no templates".to_string());
        }
        if background.templates.iter().any(|t| t.template_name.trim().is_empty()) {
            return Err("background analysis has a template with no name".to_string());
        }
        if let Some(start) = background.starting_step
            && start as usize > steps.len()
        {
            return Err(format!(
                "background analysis starting step {start} is past the last step ({})",
                steps.len()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stride_state::*;

    fn spec(steps: Vec<CanaryStep>) -> RolloutPluginSpec {
        RolloutPluginSpec {
            workload_ref: WorkloadRef {
                kind: "StatefulSet".to_string(),
                name: "api".to_string(),
                namespace: String::new(),
            },
            plugin: "statefulset".to_string(),
            strategy: CanaryStrategy {
                steps,
                analysis: None,
            },
            paused: false,
            min_ready_seconds: 0,
            progress_deadline_seconds: None,
            progress_deadline_abort: false,
        }
    }

    fn analysis(template: &str) -> RolloutAnalysis {
        RolloutAnalysis {
            templates: vec![AnalysisTemplateRef {
                template_name: template.to_string(),
                cluster_scope: false,
            }],
            args: vec![],
        }
    }

    #[test]
    fn accepts_well_formed_steps() {
        let spec = spec(vec![
            CanaryStep::set_weight(20),
            CanaryStep::pause(Some("bogus")),
            CanaryStep::analysis(analysis("error-rate")),
            CanaryStep::default(),
        ]);
        assert_eq!(validate_spec(&spec), Ok(()));
    }

    #[test]
    fn rejects_weight_over_100() {
        let err = validate_spec(&spec(vec![CanaryStep::set_weight(101)])).unwrap_err();
        assert!(err.contains("101"));
    }

    #[test]
    fn rejects_multi_action_step() {
        let mut step = CanaryStep::set_weight(10);
        step.pause = Some(RolloutPause::default());
        let err = validate_spec(&spec(vec![step])).unwrap_err();
        assert!(err.contains("step 0"));
    }

    #[test]
    fn rejects_analysis_without_templates() {
        let step = CanaryStep::analysis(RolloutAnalysis::default());
        assert!(validate_spec(&spec(vec![step])).is_err());
        assert!(validate_spec(&spec(vec![CanaryStep::analysis(analysis(" "))])).is_err());
    }

    #[test]
    fn rejects_missing_plugin_and_workload() {
        let mut s = spec(vec![]);
        s.plugin.clear();
        assert!(validate_spec(&s).is_err());

        let mut s = spec(vec![]);
        s.workload_ref.name.clear();
        assert!(validate_spec(&s).is_err());
    }

    #[test]
    fn background_starting_step_must_exist() {
        let mut s = spec(vec![CanaryStep::set_weight(50)]);
        s.strategy.analysis = Some(BackgroundAnalysis {
            templates: analysis("latency").templates,
            args: vec![],
            starting_step: Some(2),
        });
        assert!(validate_spec(&s).is_err());
        s.strategy.analysis.as_mut().unwrap().starting_step = Some(1);
        assert!(validate_spec(&s).is_ok());
    }
}
