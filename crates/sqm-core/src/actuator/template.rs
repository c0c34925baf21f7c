//! Shaping-fragment templating
//!
//! A template is a shell script containing `{{placeholder}}` markers. The
//! set of placeholders is closed and every interpolated value is checked
//! against a restricted character set before substitution.

use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{Result, SqmError};
use crate::models::RatePair;

const PLACEHOLDERS: [&str; 6] = [
    "link_id",
    "interface",
    "ifb_interface",
    "down_kbit",
    "up_kbit",
    "qdisc_options",
];

const MAX_INTERFACE_LEN: usize = 15;
const MAX_LINK_ID_LEN: usize = 64;

/// CAKE on egress, and on an IFB mirror of the interface for ingress
pub const DEFAULT_TEMPLATE: &str = r#"#!/bin/sh
# adaptive-sqm shaping for {{link_id}}
set -e
IFACE="{{interface}}"
IFB="{{ifb_interface}}"

ip link show "$IFB" >/dev/null 2>&1 || ip link add name "$IFB" type ifb
ip link set dev "$IFB" up

tc qdisc replace dev "$IFACE" root cake bandwidth {{up_kbit}}kbit {{qdisc_options}}

tc qdisc del dev "$IFACE" ingress >/dev/null 2>&1 || true
tc qdisc add dev "$IFACE" handle ffff: ingress
tc filter add dev "$IFACE" parent ffff: protocol all matchall action mirred egress redirect dev "$IFB"
tc qdisc replace dev "$IFB" root cake bandwidth {{down_kbit}}kbit {{qdisc_options}} ingress
"#;

pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_INTERFACE_LEN {
        return Err(SqmError::invalid(
            "interface",
            format!("'{}' must be 1-{} characters", name, MAX_INTERFACE_LEN),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(SqmError::invalid(
            "interface",
            format!("'{}' contains characters outside [A-Za-z0-9_.-]", name),
        ));
    }
    if name.starts_with('-') {
        return Err(SqmError::invalid("interface", format!("'{}' starts with '-'", name)));
    }
    Ok(())
}

pub fn validate_link_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_LINK_ID_LEN {
        return Err(SqmError::invalid(
            "link id",
            format!("'{}' must be 1-{} characters", id, MAX_LINK_ID_LEN),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err(SqmError::invalid(
            "link id",
            format!("'{}' contains characters outside [A-Za-z0-9_-]", id),
        ));
    }
    Ok(())
}

/// Whitespace-separated CAKE keywords such as `docsis ack-filter nat`
pub fn validate_qdisc_options(options: &str) -> Result<()> {
    for token in options.split_whitespace() {
        if !token
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(SqmError::invalid(
                "qdisc options",
                format!("token '{}' contains characters outside [a-z0-9-]", token),
            ));
        }
    }
    Ok(())
}

/// IFB device mirroring ingress of `interface`, kept within the kernel name limit
pub fn ifb_name_for(interface: &str) -> String {
    let mut name = format!("ifb4{}", interface);
    name.truncate(MAX_INTERFACE_LEN);
    name
}

pub fn mbps_to_kbit(mbps: f64) -> u64 {
    (mbps * 1000.0).round().max(0.0) as u64
}

/// Values interpolated into a fragment
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentParams<'a> {
    pub link_id: &'a str,
    pub interface: &'a str,
    pub rates: RatePair,
    pub qdisc_options: &'a str,
}

/// Rendered script and its content hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFragment {
    pub content: String,
    /// Lowercase hex SHA-256 of `content`
    pub content_hash: String,
}

pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct ShapingTemplate {
    source: String,
}

impl Default for ShapingTemplate {
    fn default() -> Self {
        Self {
            source: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl ShapingTemplate {
    /// Parse a template, rejecting unknown or unterminated placeholders
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let mut rest = source.as_str();
        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                SqmError::invalid("template", "unterminated '{{' placeholder")
            })?;
            let name = after[..end].trim();
            if !PLACEHOLDERS.contains(&name) {
                return Err(SqmError::invalid(
                    "template",
                    format!("unknown placeholder '{{{{{}}}}}'", name),
                ));
            }
            rest = &after[end + 2..];
        }
        Ok(Self { source })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            SqmError::invalid(
                "template",
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        Self::new(source)
    }

    pub fn render(&self, params: &FragmentParams<'_>) -> Result<RenderedFragment> {
        validate_link_id(params.link_id)?;
        validate_interface_name(params.interface)?;
        validate_qdisc_options(params.qdisc_options)?;

        let down_kbit = mbps_to_kbit(params.rates.down_mbps);
        let up_kbit = mbps_to_kbit(params.rates.up_mbps);
        if !params.rates.down_mbps.is_finite() || !params.rates.up_mbps.is_finite() || down_kbit == 0 || up_kbit == 0 {
            return Err(SqmError::invalid(
                "rate",
                format!("{} does not render to positive kbit values", params.rates),
            ));
        }

        let ifb = ifb_name_for(params.interface);
        let qdisc_options = params
            .qdisc_options
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        let mut content = String::with_capacity(self.source.len() + 64);
        let mut rest = self.source.as_str();
        while let Some(start) = rest.find("{{") {
            content.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                break;
            };
            let value = match after[..end].trim() {
                "link_id" => params.link_id.to_string(),
                "interface" => params.interface.to_string(),
                "ifb_interface" => ifb.clone(),
                "down_kbit" => down_kbit.to_string(),
                "up_kbit" => up_kbit.to_string(),
                "qdisc_options" => qdisc_options.clone(),
                other => {
                    return Err(SqmError::invalid(
                        "template",
                        format!("unknown placeholder '{}'", other),
                    ))
                }
            };
            content.push_str(&value);
            rest = &after[end + 2..];
        }
        content.push_str(rest);

        let content_hash = content_hash(&content);
        Ok(RenderedFragment {
            content,
            content_hash,
        })
    }
}
