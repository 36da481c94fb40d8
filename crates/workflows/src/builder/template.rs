// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Data volume naming templates.
//!
//! Templates are written either in Go template syntax, as plans usually
//! carry them (`{{.VmName}}-disk-{{.DiskIndex}}`,
//! `{{if eq .DiskIndex .RootDiskIndex}}root{{else}}data{{end}}`), or in plain
//! tera syntax. Go actions are rewritten to tera before rendering; only field
//! references, `if`/`else if`/`else`/`end` and the comparison and boolean
//! functions are understood.

use common::prelude::{once_cell::sync::Lazy, regex::Regex};
use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

static GO_ACTION: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\{\{(-?)\s*(.*?)\s*(-?)\}\}").unwrap()
});

static GO_TOKEN: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r#""[^"]*"|\S+"#).unwrap()
});

static DNS1123_LABEL: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap()
});

const MAX_LABEL_LENGTH: usize = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template could not be rendered: {0}")]
    Render(String),

    #[error("template rendered an empty name")]
    Empty,

    #[error("`{0}` is not a valid DNS-1123 label")]
    InvalidLabel(String),
}

/// Values a volume name template can refer to
#[derive(Serialize, Debug, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct PvcNameData {
    pub vm_name: String,
    pub target_vm_name: String,
    pub plan_name: String,
    pub disk_index: usize,
    pub root_disk_index: usize,
    pub shared: bool,
    pub file_name: String,
    pub win_drive_letter: String,
}

pub fn is_dns1123_label(s: &str) -> bool {
    s.len() <= MAX_LABEL_LENGTH && DNS1123_LABEL.is_match(s)
}

fn unsupported(action: &str) -> TemplateError {
    TemplateError::Render(format!("unsupported template action `{{{{{action}}}}}`"))
}

fn operand(token: &str) -> Option<String> {
    match token.strip_prefix('.') {
        Some(field) if !field.is_empty() && !field.contains('.') => Some(field.to_owned()),
        Some(_) => None,
        None if token.starts_with('"') || token.parse::<f64>().is_ok() => Some(token.to_owned()),
        None if token == "true" || token == "false" => Some(token.to_owned()),
        None => None,
    }
}

/// Rewrites a Go pipeline such as `eq .DiskIndex .RootDiskIndex` as a tera
/// expression
fn expression(action: &str, pipeline: &str) -> Result<String, TemplateError> {
    let tokens: Vec<&str> = GO_TOKEN.find_iter(pipeline).map(|m| m.as_str()).collect();
    let (func, args) = tokens.split_first().ok_or_else(|| unsupported(action))?;
    let args = args
        .iter()
        .map(|a| operand(a))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| unsupported(action))?;

    let compare = |op: &str| match args.as_slice() {
        [a, b] => Ok(format!("{a} {op} {b}")),
        _ => Err(unsupported(action)),
    };

    match *func {
        "eq" => match args.as_slice() {
            [a, rest @ ..] if !rest.is_empty() => Ok(rest
                .iter()
                .map(|b| format!("{a} == {b}"))
                .collect::<Vec<_>>()
                .join(" or ")),
            _ => Err(unsupported(action)),
        },
        "ne" => compare("!="),
        "lt" => compare("<"),
        "le" => compare("<="),
        "gt" => compare(">"),
        "ge" => compare(">="),
        "not" => match args.as_slice() {
            [a] => Ok(format!("not {a}")),
            _ => Err(unsupported(action)),
        },
        "and" | "or" if args.len() >= 2 => Ok(args.join(&format!(" {func} "))),
        single if args.is_empty() => operand(single).ok_or_else(|| unsupported(action)),
        _ => Err(unsupported(action)),
    }
}

/// Rewrites the Go actions of `template` as tera tags, leaving tera syntax as is
fn to_tera(template: &str) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in GO_ACTION.captures_iter(template) {
        let (Some(whole), Some(action)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        let (open, close) = (&caps[1], &caps[3]);
        let action = action.as_str();
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        let tag = |body: String| format!("{{%{open} {body} {close}%}}");
        let rewritten = if action == "else" {
            tag("else".to_owned())
        } else if action == "end" {
            tag("endif".to_owned())
        } else if let Some(cond) = action.strip_prefix("else if ") {
            tag(format!("elif {}", expression(action, cond)?))
        } else if let Some(cond) = action.strip_prefix("if ") {
            tag(format!("if {}", expression(action, cond)?))
        } else if action.starts_with('.') {
            format!("{{{{{open} {} {close}}}}}", expression(action, action)?)
        } else {
            // already tera
            whole.as_str().to_owned()
        };
        out.push_str(&rewritten);
    }

    out.push_str(&template[last..]);
    Ok(out)
}

/// Renders `template` and checks the result is usable as a volume name
pub fn pvc_name(template: &str, data: &PvcNameData) -> Result<String, TemplateError> {
    let context = Context::from_serialize(data).map_err(|e| TemplateError::Render(e.to_string()))?;

    let rendered = Tera::one_off(&to_tera(template)?, &context, false)
        .map_err(|e| TemplateError::Render(e.to_string()))?;
    let name = rendered.trim();

    if name.is_empty() {
        return Err(TemplateError::Empty);
    }
    if !is_dns1123_label(name) {
        return Err(TemplateError::InvalidLabel(name.to_owned()));
    }

    Ok(name.to_owned())
}

/// `[ds1] vm/disk-1.vmdk` becomes `disk-1`
pub fn file_stem(file: &str) -> String {
    let base = file.rsplit('/').next().unwrap_or(file);
    let base = base.rsplit(' ').next().unwrap_or(base);

    base.strip_suffix(".vmdk").unwrap_or(base).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> PvcNameData {
        PvcNameData {
            vm_name: "web-01".into(),
            target_vm_name: "web-01".into(),
            plan_name: "wave-1".into(),
            disk_index: 2,
            root_disk_index: 0,
            shared: false,
            file_name: "web-01_1".into(),
            win_drive_letter: "d".into(),
        }
    }

    #[test]
    fn go_style_fields_render() {
        assert_eq!(
            pvc_name("{{.VmName}}-disk-{{.DiskIndex}}", &data()).unwrap(),
            "web-01-disk-2"
        );
        assert_eq!(
            pvc_name("{{ .PlanName }}-{{.WinDriveLetter}}", &data()).unwrap(),
            "wave-1-d"
        );
    }

    #[test]
    fn go_conditionals_render() {
        let root_or_data = "{{if eq .DiskIndex .RootDiskIndex}}root{{else}}data{{end}}-{{.DiskIndex}}";
        assert_eq!(pvc_name(root_or_data, &data()).unwrap(), "data-2");
        let root = PvcNameData {
            disk_index: 0,
            ..data()
        };
        assert_eq!(pvc_name(root_or_data, &root).unwrap(), "root-0");

        let shared = "{{if .Shared}}shared-{{end}}{{.VmName}}-{{.DiskIndex}}";
        assert_eq!(pvc_name(shared, &data()).unwrap(), "web-01-2");
        let is_shared = PvcNameData {
            shared: true,
            ..data()
        };
        assert_eq!(pvc_name(shared, &is_shared).unwrap(), "shared-web-01-2");
    }

    #[test]
    fn go_chains_and_trim_markers() {
        assert_eq!(
            pvc_name(
                "{{- if gt .DiskIndex 3 -}} big {{- else if not .Shared -}} own {{- else -}} shared {{- end -}}",
                &data()
            )
            .unwrap(),
            "own"
        );
        assert_eq!(
            pvc_name("{{if and .Shared (eq .DiskIndex 2)}}x{{end}}", &data()),
            Err(TemplateError::Render("unsupported template action `{{if and .Shared (eq .DiskIndex 2)}}`".into()))
        );
    }

    #[test]
    fn tera_syntax_is_accepted_too() {
        assert_eq!(
            pvc_name("{{ TargetVmName }}-{% if Shared %}shared{% else %}own{% endif %}", &data()).unwrap(),
            "web-01-own"
        );
    }

    #[test]
    fn bad_templates_are_rejected() {
        assert!(matches!(pvc_name("{{.VmName", &data()), Err(TemplateError::Render(_))));
        assert!(matches!(pvc_name("{{.Missing}}", &data()), Err(TemplateError::Render(_))));
        assert_eq!(pvc_name("{{.FileName}}_x", &data()), Err(TemplateError::InvalidLabel("web-01_1_x".into())));
        assert_eq!(pvc_name("  ", &data()), Err(TemplateError::Empty));
    }

    #[test]
    fn label_length_is_bounded() {
        assert!(is_dns1123_label(&"a".repeat(63)));
        assert!(!is_dns1123_label(&"a".repeat(64)));
        assert!(!is_dns1123_label("-a"));
        assert!(!is_dns1123_label("A"));
    }

    #[test]
    fn stems() {
        assert_eq!(file_stem("[ds1] vm/disk1.vmdk"), "disk1");
        assert_eq!(file_stem("[ds1] disk1.vmdk"), "disk1");
        assert_eq!(file_stem("plain"), "plain");
    }
}
