// error.rs — Autonomy controller errors.
//
// Gate failures are not errors: they are normal suppressions, audited and
// reported in the outcome. Errors here are infrastructure failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutonomyError {
    #[error(transparent)]
    Store(#[from] aegis_store::StoreError),

    #[error(transparent)]
    Deploy(#[from] aegis_deploy::DeployError),

    #[error("template error: {0}")]
    Template(#[from] aegis_policy::PolicyError),
}
