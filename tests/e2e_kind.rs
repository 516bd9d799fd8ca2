use std::error::Error;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const OPERATOR_NAMESPACE: &str = "vault-operator-system";
const TEST_NAMESPACE: &str = "vault-e2e";
const OPERATOR_NAME: &str = "vault-operator";
const CLUSTER_NAME: &str = "e2e-vault";

/// Returns true if the given binary is accessible in PATH.
fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// Full lifecycle of a single-instance VaultCluster on a Kind cluster:
///
/// 1. Install the CRD produced by `crdgen` and deploy the operator.
/// 2. Create a VaultCluster and wait for its service, config and first pod.
/// 3. Initialize Vault from inside the pod; the status moves to `Sealed`.
/// 4. Unseal it; the status reports an active node and `Running`.
/// 5. Delete the VaultCluster; owned resources are garbage collected.
///
/// Run with: E2E_KIND=1 cargo test --test e2e_kind -- --ignored
#[test]
#[ignore]
fn e2e_vault_cluster_lifecycle() -> Result<(), Box<dyn Error>> {
    if std::env::var("E2E_KIND").is_err() {
        eprintln!("E2E_KIND is not set; skipping KinD E2E test.");
        return Ok(());
    }
    for tool in &["kind", "kubectl", "docker"] {
        if !tool_available(tool) {
            eprintln!("Skipping e2e test: `{tool}` not found in PATH.");
            return Ok(());
        }
    }

    let kind_cluster = std::env::var("KIND_CLUSTER_NAME").unwrap_or_else(|_| "vault-e2e".into());
    ensure_kind_cluster(&kind_cluster)?;

    let image = std::env::var("E2E_OPERATOR_IMAGE").unwrap_or_else(|_| "vault-operator:e2e".into());
    if env_true("E2E_BUILD_IMAGE", false) {
        run_cmd("docker", &["build", "-t", &image, "."])?;
    }
    if env_true("E2E_LOAD_IMAGE", true) {
        run_cmd(
            "kind",
            &["load", "docker-image", &image, "--name", &kind_cluster],
        )?;
    }

    let crd = run_cmd(env!("CARGO_BIN_EXE_crdgen"), &[])?;
    kubectl_apply(&crd)?;

    let operator_yaml = operator_manifest(&image);
    let _cleanup = Cleanup::new(operator_yaml.clone());

    create_namespace(OPERATOR_NAMESPACE)?;
    kubectl_apply(&operator_yaml)?;
    run_cmd(
        "kubectl",
        &[
            "rollout",
            "status",
            "deployment/vault-operator",
            "-n",
            OPERATOR_NAMESPACE,
            "--timeout=180s",
        ],
    )?;

    create_namespace(TEST_NAMESPACE)?;
    kubectl_apply(&vault_cluster_manifest())?;

    wait_for("Service created", Duration::from_secs(60), || {
        Ok(run_cmd(
            "kubectl",
            &["get", "service", CLUSTER_NAME, "-n", TEST_NAMESPACE],
        )
        .is_ok())
    })?;

    wait_for("ConfigMap created", Duration::from_secs(60), || {
        Ok(run_cmd(
            "kubectl",
            &[
                "get",
                "configmap",
                &format!("{CLUSTER_NAME}-config"),
                "-n",
                TEST_NAMESPACE,
            ],
        )
        .is_ok())
    })?;

    // An uninitialized instance is reachable but the cluster is not yet usable
    wait_for("one available node", Duration::from_secs(180), || {
        Ok(cluster_field("{.status.availableNodes[*]}").split_whitespace().count() == 1)
    })?;
    wait_for("phase Initializing", Duration::from_secs(60), || {
        Ok(cluster_field("{.status.phase}") == "Initializing")
    })?;

    let pod = cluster_field("{.status.availableNodes[0]}");
    let init = vault_cli(&pod, &["operator", "init", "-key-shares=1", "-key-threshold=1", "-format=json"])?;
    let init: serde_json::Value = serde_json::from_str(&init)?;
    let unseal_key = init["unseal_keys_b64"][0]
        .as_str()
        .ok_or("init response has no unseal key")?
        .to_string();

    wait_for("phase Sealed", Duration::from_secs(60), || {
        Ok(cluster_field("{.status.phase}") == "Sealed")
    })?;

    vault_cli(&pod, &["operator", "unseal", &unseal_key])?;

    wait_for("active node reported", Duration::from_secs(90), || {
        Ok(cluster_field("{.status.activeNode}") == pod)
    })?;
    wait_for("phase Running", Duration::from_secs(60), || {
        Ok(cluster_field("{.status.phase}") == "Running")
    })?;

    run_cmd(
        "kubectl",
        &[
            "delete",
            "vaultcluster",
            CLUSTER_NAME,
            "-n",
            TEST_NAMESPACE,
            "--timeout=180s",
            "--wait=true",
        ],
    )?;

    wait_for("owned resources cleaned up", Duration::from_secs(120), || {
        let service = run_cmd(
            "kubectl",
            &["get", "service", CLUSTER_NAME, "-n", TEST_NAMESPACE],
        );
        let pods = run_cmd(
            "kubectl",
            &[
                "get",
                "pods",
                "-n",
                TEST_NAMESPACE,
                "-l",
                &format!("vault.security.coreos.com/cluster={CLUSTER_NAME}"),
                "-o",
                "name",
            ],
        )
        .unwrap_or_default();
        Ok(service.is_err() && pods.is_empty())
    })?;

    Ok(())
}

fn cluster_field(jsonpath: &str) -> String {
    run_cmd(
        "kubectl",
        &[
            "get",
            "vaultcluster",
            CLUSTER_NAME,
            "-n",
            TEST_NAMESPACE,
            "-o",
            &format!("jsonpath={jsonpath}"),
        ],
    )
    .unwrap_or_default()
}

/// Run the vault CLI inside an instance pod against its own listener
fn vault_cli(pod: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let mut full = vec!["exec", pod, "-n", TEST_NAMESPACE, "-c", "vault", "--", "vault"];
    full.extend_from_slice(args);
    full.push("-address=https://127.0.0.1:8200");
    run_cmd("kubectl", &full)
}

fn vault_cluster_manifest() -> String {
    format!(
        r#"apiVersion: vault.security.coreos.com/v1alpha1
kind: VaultCluster
metadata:
  name: {name}
  namespace: {namespace}
spec:
  replicas: 1
  version: "1.17.2"
  configSnippet: |
    storage "file" {{
      path = "/vault/file"
    }}
"#,
        name = CLUSTER_NAME,
        namespace = TEST_NAMESPACE,
    )
}

fn operator_manifest(image: &str) -> String {
    format!(
        r#"---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: {operator_name}
  namespace: {operator_namespace}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: {operator_name}
rules:
  - apiGroups: ["apiextensions.k8s.io"]
    resources: ["customresourcedefinitions"]
    verbs: ["get"]
  - apiGroups: ["vault.security.coreos.com"]
    resources: ["vaultclusters"]
    verbs: ["get", "list", "watch"]
  - apiGroups: ["vault.security.coreos.com"]
    resources: ["vaultclusters/status"]
    verbs: ["get", "update", "patch"]
  - apiGroups: [""]
    resources: ["pods"]
    verbs: ["get", "list", "watch", "create", "delete"]
  - apiGroups: [""]
    resources: ["services", "configmaps", "secrets"]
    verbs: ["get", "list", "watch", "create", "update", "patch"]
  - apiGroups: [""]
    resources: ["events"]
    verbs: ["create", "patch"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: {operator_name}
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: {operator_name}
subjects:
  - kind: ServiceAccount
    name: {operator_name}
    namespace: {operator_namespace}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {operator_name}
  namespace: {operator_namespace}
spec:
  replicas: 1
  selector:
    matchLabels:
      app: {operator_name}
  template:
    metadata:
      labels:
        app: {operator_name}
    spec:
      serviceAccountName: {operator_name}
      containers:
        - name: operator
          image: {image}
          imagePullPolicy: IfNotPresent
          args: ["run"]
          env:
            - name: RESYNC_INTERVAL_SECS
              value: "5"
"#,
        operator_name = OPERATOR_NAME,
        operator_namespace = OPERATOR_NAMESPACE,
        image = image
    )
}

struct Cleanup {
    operator_manifest: String,
}

impl Cleanup {
    fn new(operator_manifest: String) -> Self {
        Self { operator_manifest }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        let _ = run_cmd_quiet(
            "kubectl",
            &[
                "delete",
                "vaultcluster",
                CLUSTER_NAME,
                "-n",
                TEST_NAMESPACE,
                "--ignore-not-found=true",
                "--timeout=60s",
            ],
        );
        let _ =
            run_cmd_with_stdin_quiet("kubectl", &["delete", "-f", "-"], &self.operator_manifest);
        for namespace in [TEST_NAMESPACE, OPERATOR_NAMESPACE] {
            let _ = run_cmd_quiet(
                "kubectl",
                &["delete", "namespace", namespace, "--ignore-not-found=true"],
            );
        }
    }
}

fn ensure_kind_cluster(name: &str) -> Result<(), Box<dyn Error>> {
    let clusters = run_cmd("kind", &["get", "clusters"])?;
    if clusters.lines().any(|line| line.trim() == name) {
        return Ok(());
    }
    run_cmd("kind", &["create", "cluster", "--name", name])?;
    Ok(())
}

fn create_namespace(name: &str) -> Result<(), Box<dyn Error>> {
    let manifest = run_cmd(
        "kubectl",
        &["create", "namespace", name, "--dry-run=client", "-o", "yaml"],
    )?;
    kubectl_apply(&manifest)
}

fn kubectl_apply(manifest: &str) -> Result<(), Box<dyn Error>> {
    run_cmd_with_stdin("kubectl", &["apply", "-f", "-"], manifest)
}

fn command(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    cmd
}

fn run_cmd(program: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let output = command(program, args).output()?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "command failed: {} {:?}\nstdout:\n{}\nstderr:\n{}",
            program, args, stdout, stderr
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_cmd_with_stdin(program: &str, args: &[&str], input: &str) -> Result<(), Box<dyn Error>> {
    let mut child = command(program, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        stdin.write_all(input.as_bytes())?;
        stdin.flush()?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("command failed: {} {:?}\nstderr:\n{}", program, args, stderr).into());
    }
    Ok(())
}

fn run_cmd_quiet(program: &str, args: &[&str]) -> Result<(), Box<dyn Error>> {
    command(program, args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    Ok(())
}

fn run_cmd_with_stdin_quiet(program: &str, args: &[&str], input: &str) -> Result<(), Box<dyn Error>> {
    let mut child = command(program, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        stdin.write_all(input.as_bytes())?;
    }
    child.wait()?;
    Ok(())
}

fn wait_for<F>(label: &str, timeout: Duration, mut condition: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut() -> Result<bool, Box<dyn Error>>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if condition()? {
            return Ok(());
        }
        attempts += 1;
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout while waiting for {} after {:?} (attempts={})",
                label, timeout, attempts
            )
            .into());
        }
        sleep(Duration::from_secs(3));
    }
}

fn env_true(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
