// Controller name matched against GatewayClass.spec.controllerName.
pub const GATEWAY_CLASS_CONTROLLER_NAME: &str = "konghq.com/gateway-operator";

// Field manager used for server-side apply of status.
pub const OPERATOR_FIELD_MANAGER: &str = "gateway-operator";

// API group of the operator's own resources.
pub const OPERATOR_API_GROUP: &str = "gateway-operator.konghq.com";

// ============================================================================
// Labels
// ============================================================================

// Which operator component manages the object (dataplane, controlplane, gateway).
pub const MANAGED_BY_LABEL: &str = "gateway-operator.konghq.com/managed-by";

// UID of the custom resource owning the object.
pub const OWNER_UID_LABEL: &str = "gateway-operator.konghq.com/owner-uid";

// Name and namespace of the owning custom resource. Informational, and used to map
// cluster-scoped objects back to their namespaced owner.
pub const OWNER_NAME_LABEL: &str = "gateway-operator.konghq.com/managed-by-name";
pub const OWNER_NAMESPACE_LABEL: &str = "gateway-operator.konghq.com/managed-by-namespace";

// Role of a DataPlane Service (and of the TLS Secret serving it).
pub const SERVICE_TYPE_LABEL: &str = "gateway-operator.konghq.com/dataplane-service-type";

// Rollout state of a DataPlane Service.
pub const SERVICE_STATE_LABEL: &str = "gateway-operator.konghq.com/dataplane-service-state";

// Rollout state of a DataPlane Deployment and its pods.
pub const DEPLOYMENT_STATE_LABEL: &str = "gateway-operator.konghq.com/dataplane-deployment-state";

// What an operator-issued certificate Secret is used for.
pub const SECRET_PURPOSE_LABEL: &str = "gateway-operator.konghq.com/secret-purpose";

pub const SECRET_PURPOSE_ADMIN_CLIENT: &str = "admin-client";
pub const SECRET_PURPOSE_WEBHOOK: &str = "webhook";

// Kong plugin type of an operator-created KongPlugin.
pub const PLUGIN_TYPE_LABEL: &str = "gateway-operator.konghq.com/kong-plugin-type";

// Pod label carrying the owner name, used in Service and Deployment selectors.
pub const APP_LABEL: &str = "app";

pub const MANAGED_BY_DATAPLANE: &str = "dataplane";
pub const MANAGED_BY_CONTROLPLANE: &str = "controlplane";
pub const MANAGED_BY_GATEWAY: &str = "gateway";

pub const SERVICE_TYPE_INGRESS: &str = "ingress";
pub const SERVICE_TYPE_ADMIN: &str = "admin";

pub const STATE_LIVE: &str = "live";
pub const STATE_PREVIEW: &str = "preview";

// ============================================================================
// Annotations
// ============================================================================

// Setting this to "true" on a DataPlane promotes a ready preview deployment.
pub const PROMOTE_WHEN_READY_ANNOTATION: &str = "gateway-operator.konghq.com/promote-when-ready";

// Hash of the rendered pod template (or other hashed spec) of an owned object.
pub const SPEC_HASH_ANNOTATION: &str = "gateway-operator.konghq.com/spec-hash";

// Hash of the inputs a DataPlane Deployment template is rendered from, equal for
// the live and preview Deployments of the same spec.
pub const TEMPLATE_HASH_ANNOTATION: &str = "gateway-operator.konghq.com/template-hash";

// Comma-separated annotation keys the operator wrote on an owned object.
pub const LAST_APPLIED_ANNOTATIONS: &str = "gateway-operator.konghq.com/last-applied-annotations";

// Hash of the SAN set a certificate Secret was issued for.
pub const CERTIFICATE_SANS_ANNOTATION: &str = "gateway-operator.konghq.com/certificate-sans";

// Comma-separated list of KongPlugin names bound to a Service or Route.
pub const KONG_PLUGINS_ANNOTATION: &str = "konghq.com/plugins";

// ============================================================================
// Finalizers
// ============================================================================

pub const CLEANUP_CLUSTER_ROLE_FINALIZER: &str = "gateway-operator.konghq.com/cleanup-clusterrole";
pub const CLEANUP_CLUSTER_ROLE_BINDING_FINALIZER: &str =
    "gateway-operator.konghq.com/cleanup-clusterrolebinding";
pub const CLEANUP_WEBHOOK_CONFIGURATION_FINALIZER: &str =
    "gateway-operator.konghq.com/cleanup-validatingwebhookconfiguration";
pub const CLEANUP_PLUGIN_BINDINGS_FINALIZER: &str =
    "gateway-operator.konghq.com/cleanup-plugin-bindings";

// ============================================================================
// Containers and ports
// ============================================================================

pub const DATAPLANE_PROXY_CONTAINER: &str = "proxy";
pub const CONTROLPLANE_CONTAINER: &str = "controller";

pub const DEFAULT_DATAPLANE_IMAGE: &str = "kong:3.8";
pub const DEFAULT_CONTROLPLANE_IMAGE: &str = "kong/kubernetes-ingress-controller:3.3";

pub const PROXY_PORT: i32 = 8000;
pub const PROXY_SSL_PORT: i32 = 8443;
pub const ADMIN_API_PORT: i32 = 8444;
pub const STATUS_PORT: i32 = 8100;

pub const DEFAULT_HTTP_PORT: i32 = 80;
pub const DEFAULT_HTTPS_PORT: i32 = 443;

pub const WEBHOOK_PORT: i32 = 8080;
pub const WEBHOOK_SERVICE_PORT: i32 = 443;
pub const CONTROLPLANE_HEALTH_PORT: i32 = 10254;

// Mount paths for certificates inside operator-managed pods.
pub const CLUSTER_CERTIFICATE_VOLUME: &str = "cluster-certificate";
pub const CLUSTER_CERTIFICATE_PATH: &str = "/var/cluster-certificate";
pub const WEBHOOK_CERTIFICATE_VOLUME: &str = "admission-webhook-certificate";
pub const WEBHOOK_CERTIFICATE_PATH: &str = "/admission-webhook";

// Directory where KongPluginInstallation ConfigMaps are mounted.
pub const PLUGINS_MOUNT_PATH: &str = "/opt/kong/plugins";

// Secret data keys.
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";
