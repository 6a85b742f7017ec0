use super::{BlueprintRenderer, RenderError, RenderedFiles};
use serde_json::{json, Map, Value};

pub const DEFAULT_MODULE_SOURCE_BASE: &str = "git::https://git.example.com/terraform-modules";

const MAIN_FILE: &str = "main.tf";
const TFVARS_FILE: &str = "terraform.tfvars.json";

/// Renders the blueprint kinds this service ships with into a root module that
/// calls the matching shared Terraform module.
#[derive(Debug, Clone)]
pub struct BuiltinRenderer {
    module_source_base: String,
}

impl Default for BuiltinRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_MODULE_SOURCE_BASE)
    }
}

impl BuiltinRenderer {
    pub fn new(module_source_base: impl Into<String>) -> Self {
        Self {
            module_source_base: module_source_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn supported_kinds() -> &'static [&'static str] {
        &["gke-cluster", "postgres-db"]
    }

    fn render_gke_cluster(&self, variables: &Map<String, Value>) -> Result<RenderedFiles, RenderError> {
        let cluster_name = string_var(variables, "cluster_name", "default-cluster")?;
        let region = string_var(variables, "region", "us-central1")?;
        let node_count = count_var(variables, "node_count", 3)?;

        let main = format!(
            "module \"gke_cluster\" {{\n  source       = {source}\n  cluster_name = {cluster_name}\n  region       = {region}\n  node_count   = {node_count}\n}}\n",
            source = hcl_string(&format!("{}/gke.git", self.module_source_base)),
            cluster_name = hcl_string(&cluster_name),
            region = hcl_string(&region),
        );
        files(
            main,
            json!({
                "cluster_name": cluster_name,
                "region": region,
                "node_count": node_count,
            }),
        )
    }

    fn render_postgres_db(&self, variables: &Map<String, Value>) -> Result<RenderedFiles, RenderError> {
        let db_name = string_var(variables, "db_name", "default-db")?;
        let db_user = string_var(variables, "db_user", "dbadmin")?;
        let plan = string_var(variables, "plan", "standard")?;

        let main = format!(
            "module \"postgres_db\" {{\n  source  = {source}\n  db_name = {db_name}\n  db_user = {db_user}\n  plan    = {plan}\n}}\n",
            source = hcl_string(&format!("{}/postgres.git", self.module_source_base)),
            db_name = hcl_string(&db_name),
            db_user = hcl_string(&db_user),
            plan = hcl_string(&plan),
        );
        files(
            main,
            json!({
                "db_name": db_name,
                "db_user": db_user,
                "plan": plan,
            }),
        )
    }
}

impl BlueprintRenderer for BuiltinRenderer {
    fn render(&self, kind: &str, variables: &Map<String, Value>) -> Result<RenderedFiles, RenderError> {
        match kind.trim() {
            "" => Err(RenderError::MissingKind),
            "gke-cluster" => self.render_gke_cluster(variables),
            "postgres-db" => self.render_postgres_db(variables),
            other => Err(RenderError::UnknownKind {
                kind: other.to_string(),
            }),
        }
    }
}

fn files(main: String, tfvars: Value) -> Result<RenderedFiles, RenderError> {
    let tfvars = serde_json::to_string_pretty(&tfvars).map_err(|source| RenderError::Encode {
        file: TFVARS_FILE.to_string(),
        source,
    })?;
    let mut out = RenderedFiles::new();
    out.insert(MAIN_FILE.to_string(), main);
    out.insert(TFVARS_FILE.to_string(), tfvars);
    Ok(out)
}

fn string_var(variables: &Map<String, Value>, name: &str, default: &str) -> Result<String, RenderError> {
    match variables.get(name) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value.clone()),
        Some(Value::String(_)) => Err(RenderError::InvalidVariable {
            name: name.to_string(),
            reason: "must be non-empty".to_string(),
        }),
        Some(_) => Err(RenderError::InvalidVariable {
            name: name.to_string(),
            reason: "must be a string".to_string(),
        }),
    }
}

fn count_var(variables: &Map<String, Value>, name: &str, default: u64) -> Result<u64, RenderError> {
    match variables.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(value)) => value.as_u64().ok_or_else(|| RenderError::InvalidVariable {
            name: name.to_string(),
            reason: "must be a non-negative integer".to_string(),
        }),
        Some(_) => Err(RenderError::InvalidVariable {
            name: name.to_string(),
            reason: "must be a number".to_string(),
        }),
    }
}

/// Quotes a value as an HCL string literal, escaping interpolation markers.
fn hcl_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(ch);
                out.push(ch);
            }
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn gke_cluster_renders_module_call_and_tfvars() {
        let files = BuiltinRenderer::default()
            .render(
                "gke-cluster",
                &vars(json!({"cluster_name": "edge", "node_count": 5})),
            )
            .expect("render");
        let main = &files["main.tf"];
        assert!(main.contains("module \"gke_cluster\""));
        assert!(main.contains("cluster_name = \"edge\""));
        assert!(main.contains("region       = \"us-central1\""));
        assert!(main.contains("node_count   = 5"));
        let tfvars: Value = serde_json::from_str(&files["terraform.tfvars.json"]).expect("json");
        assert_eq!(tfvars, json!({"cluster_name": "edge", "region": "us-central1", "node_count": 5}));
    }

    #[test]
    fn postgres_db_uses_defaults() {
        let files = BuiltinRenderer::new("git::https://modules.internal/")
            .render("postgres-db", &Map::new())
            .expect("render");
        assert!(files["main.tf"].contains("source  = \"git::https://modules.internal/postgres.git\""));
        assert!(files["main.tf"].contains("db_name = \"default-db\""));
    }

    #[test]
    fn unknown_kind_and_bad_variables_fail() {
        let renderer = BuiltinRenderer::default();
        assert!(matches!(
            renderer.render("s3-bucket", &Map::new()),
            Err(RenderError::UnknownKind { kind }) if kind == "s3-bucket"
        ));
        assert!(matches!(
            renderer.render("gke-cluster", &vars(json!({"node_count": "three"}))),
            Err(RenderError::InvalidVariable { name, .. }) if name == "node_count"
        ));
    }

    #[test]
    fn hcl_strings_escape_quotes_and_interpolation() {
        assert_eq!(hcl_string("a\"b"), "\"a\\\"b\"");
        assert_eq!(hcl_string("${var.x}"), "\"$${var.x}\"");
    }
}
