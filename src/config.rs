use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct GuardConfig {
    /// Listener port for the admission webhook and health endpoints.
    /// TLS terminates in front of the pod. Env: UG_HTTP_PORT
    #[envconfig(from = "UG_HTTP_PORT", default = "9443")]
    pub http_port: u16,

    /// Requeue interval while a same-composite using resource is still
    /// being deleted. Env: UG_WAIT_REQUEUE_SECS
    #[envconfig(from = "UG_WAIT_REQUEUE_SECS", default = "30")]
    pub wait_requeue_secs: u64,

    /// Hard deadline for a single reconcile pass; store calls inherit it.
    /// Env: UG_RECONCILE_TIMEOUT_SECS
    #[envconfig(from = "UG_RECONCILE_TIMEOUT_SECS", default = "120")]
    pub reconcile_timeout_secs: u64,
}
