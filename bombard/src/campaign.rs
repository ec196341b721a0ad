use std::{path::Path, sync::Arc};

use serde_json::Value;
use serde_yaml::{Mapping, Value as Yaml};

use crate::{error::CampaignError, supply::Supply, template::RequestTemplate};

/// A campaign book: the initial supply and the request table.
///
/// ```yaml
/// supply:
///   host: https://example.com
/// prepare:
///   login:
///     url: "{host}/auth"
///     method: POST
///     extract: token
///     reload: profile
/// ammo:
///   profile:
///     url: "{host}/me"
///     headers:
///       Authorization: "Bearer {token}"
/// ```
///
/// Templates keep the order they are declared in.
#[derive(Debug, Clone, Default)]
pub struct Campaign {
    pub supply: Supply,
    prepare: Vec<(String, Arc<RequestTemplate>)>,
    ammo: Vec<(String, Arc<RequestTemplate>)>,
}

impl Campaign {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CampaignError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CampaignError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, CampaignError> {
        let doc: Yaml = serde_yaml::from_str(text)?;
        let doc = match doc {
            Yaml::Null => return Ok(Self::default()),
            Yaml::Mapping(m) => m,
            _ => return Err(CampaignError::Section("<root>".into())),
        };

        let supply = match section(&doc, "supply")? {
            Some(map) => map
                .iter()
                .map(|(k, v)| Ok((key(k, "supply")?, serde_yaml::from_value::<Value>(v.clone())?)))
                .collect::<Result<Supply, CampaignError>>()?,
            None => Supply::new(),
        };

        Ok(Self {
            supply,
            prepare: templates(&doc, "prepare")?,
            ammo: templates(&doc, "ammo")?,
        })
    }

    /// Add a template to the `ammo` section.
    pub fn with_ammo(mut self, name: impl Into<String>, template: RequestTemplate) -> Self {
        self.ammo.push((name.into(), Arc::new(template)));
        self
    }

    /// Add a template to the `prepare` section.
    pub fn with_prepare(mut self, name: impl Into<String>, template: RequestTemplate) -> Self {
        self.prepare.push((name.into(), Arc::new(template)));
        self
    }

    pub fn with_supply(mut self, name: impl Into<String>, value: Value) -> Self {
        self.supply.insert(name.into(), value);
        self
    }

    /// Look a template up by name, `ammo` first.
    pub fn get(&self, name: &str) -> Option<&Arc<RequestTemplate>> {
        self.ammo
            .iter()
            .chain(self.prepare.iter())
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    pub fn prepare(&self) -> impl Iterator<Item = (&str, &Arc<RequestTemplate>)> {
        self.prepare.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn ammo(&self) -> impl Iterator<Item = (&str, &Arc<RequestTemplate>)> {
        self.ammo.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Templates to reload when a run starts: the `prepare` section if it has
    /// anything, every `ammo` template otherwise.
    pub fn firing(&self) -> Vec<Arc<RequestTemplate>> {
        let section = if self.prepare.is_empty() {
            &self.ammo
        } else {
            &self.prepare
        };
        section.iter().map(|(_, t)| t.clone()).collect()
    }

    /// The `ammo` section as a JSON object, the shape scripts see.
    pub fn to_json(&self) -> Value {
        let table = self
            .ammo
            .iter()
            .map(|(name, t)| (name.clone(), serde_json::to_value(t.as_ref()).unwrap_or(Value::Null)))
            .collect::<serde_json::Map<_, _>>();
        Value::Object(table)
    }
}

fn section<'d>(doc: &'d Mapping, name: &str) -> Result<Option<&'d Mapping>, CampaignError> {
    match doc.get(name) {
        None | Some(Yaml::Null) => Ok(None),
        Some(Yaml::Mapping(m)) => Ok(Some(m)),
        Some(_) => Err(CampaignError::Section(name.to_string())),
    }
}

fn key(k: &Yaml, section: &str) -> Result<String, CampaignError> {
    match k {
        Yaml::String(s) => Ok(s.clone()),
        Yaml::Number(n) => Ok(n.to_string()),
        _ => Err(CampaignError::Section(section.to_string())),
    }
}

fn templates(doc: &Mapping, name: &str) -> Result<Vec<(String, Arc<RequestTemplate>)>, CampaignError> {
    let Some(map) = section(doc, name)? else {
        return Ok(Vec::new());
    };
    map.iter()
        .map(|(k, v)| {
            let name = key(k, name)?;
            let invalid = |reason: String| CampaignError::Template {
                name: name.clone(),
                reason,
            };
            if v.get("url").is_none() {
                return Err(invalid("missing `url`".into()));
            }
            let template: RequestTemplate =
                serde_yaml::from_value(v.clone()).map_err(|e| invalid(e.to_string()))?;
            if template.repeat == 0 {
                return Err(invalid("`repeat` must be at least 1".into()));
            }
            Ok((name, Arc::new(template)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BOOK: &str = r#"
supply:
  host: http://localhost
  limit: 3
prepare:
  login:
    url: "{host}/auth"
    method: POST
    extract: token
    reload: [profile, orders]
ammo:
  profile:
    url: "{host}/me"
    name: profile
  orders:
    url: "{host}/orders?limit={limit}"
    repeat: 2
  login:
    url: "{host}/relogin"
"#;

    #[test]
    fn loads_sections_in_declaration_order() {
        let campaign = Campaign::from_yaml(BOOK).unwrap();
        assert_eq!(campaign.supply["limit"], json!(3));
        let names: Vec<_> = campaign.ammo().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["profile", "orders", "login"]);
        assert_eq!(campaign.get("orders").unwrap().repeat, 2);
    }

    #[test]
    fn lookup_prefers_ammo_over_prepare() {
        let campaign = Campaign::from_yaml(BOOK).unwrap();
        assert_eq!(campaign.get("login").unwrap().url, "{host}/relogin");
        assert!(campaign.get("missing").is_none());
    }

    #[test]
    fn fires_prepare_when_present() {
        let campaign = Campaign::from_yaml(BOOK).unwrap();
        let firing = campaign.firing();
        assert_eq!(firing.len(), 1);
        assert_eq!(firing[0].method, "POST");

        let ammo_only = Campaign::default()
            .with_ammo("a", RequestTemplate::builder().url("http://a").build())
            .with_ammo("b", RequestTemplate::builder().url("http://b").build());
        assert_eq!(ammo_only.firing().len(), 2);
    }

    #[test]
    fn rejects_template_without_url() {
        let err = Campaign::from_yaml("ammo:\n  broken:\n    method: GET\n").unwrap_err();
        assert!(matches!(err, CampaignError::Template { ref name, .. } if name == "broken"));
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(matches!(
            Campaign::from_yaml("ammo: [1, 2"),
            Err(CampaignError::Yaml(_))
        ));
        assert!(matches!(
            Campaign::from_yaml("ammo: just a string"),
            Err(CampaignError::Section(s)) if s == "ammo"
        ));
        assert!(matches!(
            Campaign::load("/definitely/not/here.yaml"),
            Err(CampaignError::Io { .. })
        ));
    }

    #[test]
    fn empty_document_is_an_empty_campaign() {
        let campaign = Campaign::from_yaml("").unwrap();
        assert!(campaign.firing().is_empty());
        assert!(campaign.supply.is_empty());
    }

    #[test]
    fn json_table_lists_ammo() {
        let campaign = Campaign::from_yaml(BOOK).unwrap();
        let table = campaign.to_json();
        assert_eq!(table["orders"]["repeat"], json!(2));
        assert_eq!(table["profile"]["url"], json!("{host}/me"));
    }
}
