use crate::error::TemplateError;
use iri_string::{
  spec::UriSpec,
  template::{UriTemplateStr, simple_context::SimpleContext},
};
use std::fmt::{self, Write as _};

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, PartialEq, Eq)]
/// RFC 6570 URI template, validated on parse
pub struct UriTemplate {
  raw: String,
}

impl UriTemplate {
  /// Validate and keep the template
  pub fn parse(template: &str) -> Result<Self, TemplateError> {
    UriTemplateStr::new(template)?;
    Ok(Self {
      raw: template.to_string(),
    })
  }

  fn as_template_str(&self) -> Result<&UriTemplateStr, TemplateError> {
    Ok(UriTemplateStr::new(&self.raw)?)
  }

  /// Variable names referenced by the template, in order of appearance
  pub fn variables(&self) -> Vec<String> {
    let Ok(template) = self.as_template_str() else {
      return Vec::new();
    };
    template.variables().map(|var| var.as_str().to_string()).collect()
  }

  pub fn has_variable(&self, name: &str) -> bool {
    self.variables().iter().any(|var| var == name)
  }

  /// Expand the template. Variables without a value are undefined and omitted.
  pub fn expand(&self, values: &[(&str, &str)]) -> Result<String, TemplateError> {
    let mut context = SimpleContext::new();
    for (name, value) in values {
      context.insert(*name, *value);
    }
    let expanded = self.as_template_str()?.expand::<UriSpec, _>(&context)?;

    let mut out = String::with_capacity(self.raw.len());
    write!(out, "{expanded}").map_err(|_| TemplateError::Expansion(self.raw.clone()))?;
    Ok(out)
  }
}

impl std::str::FromStr for UriTemplate {
  type Err = TemplateError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl fmt::Display for UriTemplate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.raw)
  }
}
