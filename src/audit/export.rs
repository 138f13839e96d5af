use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::entry::AuditLogEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Xml,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Xml => "xml",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "xml" => Ok(ExportFormat::Xml),
            other => Err(anyhow!("unsupported export format: {}", other)),
        }
    }
}

const CSV_HEADER: &[&str] = &[
    "sequence",
    "id",
    "timestamp",
    "actor_id",
    "actor_role",
    "action",
    "resource_type",
    "resource_id",
    "details",
    "ip_address",
    "session_id",
    "success",
    "error",
    "signature",
    "chain_hash",
];

pub fn render(entries: &[AuditLogEntry], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(entries)?),
        ExportFormat::Csv => Ok(render_csv(entries)),
        ExportFormat::Xml => Ok(render_xml(entries)),
    }
}

fn render_csv(entries: &[AuditLogEntry]) -> String {
    let mut out = CSV_HEADER.join(",");
    out.push('\n');
    for e in entries {
        let row = [
            e.sequence.to_string(),
            e.id.clone(),
            e.timestamp.to_string(),
            e.actor_id.clone(),
            e.actor_role.clone(),
            e.action.to_string(),
            e.resource_type.to_string(),
            e.resource_id.clone(),
            e.details.clone(),
            e.ip_address.clone().unwrap_or_default(),
            e.session_id.clone().unwrap_or_default(),
            e.success.to_string(),
            e.error.clone().unwrap_or_default(),
            e.signature.clone(),
            e.chain_hash.clone(),
        ];
        let cells: Vec<String> = row.iter().map(|c| csv_cell(c)).collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

fn csv_cell(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_xml(entries: &[AuditLogEntry]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<auditLog>\n");
    for e in entries {
        out.push_str(&format!(
            "  <entry sequence=\"{}\" id=\"{}\" timestamp=\"{}\" success=\"{}\">\n",
            e.sequence,
            xml_escape(&e.id),
            e.timestamp,
            e.success
        ));
        push_element(&mut out, "actorId", &e.actor_id);
        push_element(&mut out, "actorRole", &e.actor_role);
        push_element(&mut out, "action", e.action.as_str());
        push_element(&mut out, "resourceType", e.resource_type.as_str());
        push_element(&mut out, "resourceId", &e.resource_id);
        push_element(&mut out, "details", &e.details);
        if let Some(ip) = &e.ip_address {
            push_element(&mut out, "ipAddress", ip);
        }
        if let Some(error) = &e.error {
            push_element(&mut out, "error", error);
        }
        if !e.metadata.is_empty() {
            out.push_str("    <metadata>\n");
            for (key, value) in &e.metadata {
                out.push_str(&format!(
                    "      <item key=\"{}\">{}</item>\n",
                    xml_escape(key),
                    xml_escape(value)
                ));
            }
            out.push_str("    </metadata>\n");
        }
        push_element(&mut out, "signature", &e.signature);
        push_element(&mut out, "chainHash", &e.chain_hash);
        out.push_str("  </entry>\n");
    }
    out.push_str("</auditLog>\n");
    out
}

fn push_element(out: &mut String, name: &str, value: &str) {
    out.push_str(&format!("    <{name}>{}</{name}>\n", xml_escape(value)));
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_quotes_embedded_separators() {
        assert_eq!(csv_cell("plain"), "plain");
        assert_eq!(csv_cell("a,b"), "\"a,b\"");
        assert_eq!(csv_cell("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn xml_escapes_markup() {
        assert_eq!(xml_escape("<a & 'b'>"), "&lt;a &amp; &apos;b&apos;&gt;");
    }

    #[test]
    fn format_parses_case_insensitively() -> Result<()> {
        assert_eq!("CSV".parse::<ExportFormat>()?, ExportFormat::Csv);
        assert!("yaml".parse::<ExportFormat>().is_err());
        Ok(())
    }
}
