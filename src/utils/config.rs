//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(CanopyError)` on parser failure.
///
/// Example:
/// ```no_run
/// # #[macro_use] extern crate canopy;
/// # use canopy::ReplicaConfig;
/// # fn f() -> Result<(), canopy::CanopyError> {
/// # let config_str: Option<&str> = None;
/// let config = parsed_config!(config_str => ReplicaConfig;
///                             applier, lease_ms, renew_factor)?;
/// # let _ = config;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config =
            || -> Result<$config_type, $crate::utils::CanopyError> {
                let mut config: $config_type = Default::default();
                if config_str.is_none() {
                    return Ok(config);
                }

                let mut table = config_str.unwrap().parse::<toml::Table>()?;

                // traverse through all given field names
                $({
                    // if field name found in table (and removed)
                    if let Some(v) = table.remove(stringify!($field)) {
                        config.$field = v.try_into()?;
                    }
                })+

                // if table is not empty at this time, some parsed keys are
                // not expected hence invalid
                if !table.is_empty() {
                    return Err($crate::utils::CanopyError(format!(
                        "invalid field name '{}' in config",
                        table.keys().next().unwrap(),
                    )));
                }

                Ok(config)
            };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::CanopyError;

    #[derive(Debug, PartialEq)]
    struct TuningConfig {
        applier: String,
        lease_ms: u64,
        renew_factor: u32,
    }

    impl Default for TuningConfig {
        fn default() -> Self {
            TuningConfig {
                applier: "tree".into(),
                lease_ms: 2000,
                renew_factor: 2,
            }
        }
    }

    #[test]
    fn defaults_when_unconfigured() -> Result<(), CanopyError> {
        let config = parsed_config!(None => TuningConfig;
                                    applier, lease_ms, renew_factor)?;
        let ref_config: TuningConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn partial_overlay_keeps_rest() -> Result<(), CanopyError> {
        let config_str = Some("lease_ms = 750\napplier = 'queue'");
        let config = parsed_config!(config_str => TuningConfig;
                                    applier, lease_ms, renew_factor)?;
        let ref_config = TuningConfig {
            applier: "queue".into(),
            lease_ms: 750,
            renew_factor: 2,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn unknown_field_rejected() {
        let config_str = Some("fsync = true");
        assert!(
            parsed_config!(config_str => TuningConfig; lease_ms).is_err()
        );
    }

    #[test]
    fn unlisted_field_rejected() {
        // lease_ms is a real field, but this call site did not opt into it
        let config_str = Some("lease_ms = 750");
        assert!(
            parsed_config!(config_str => TuningConfig; applier).is_err()
        );
    }

    #[test]
    fn wrong_value_type_rejected() {
        let config_str = Some("applier = 5");
        assert!(
            parsed_config!(config_str => TuningConfig; applier).is_err()
        );
    }
}
