use serde::{Deserialize, Serialize};

use crate::access::{OwnedResource, ResourceScope};

/// A prospect in the sales pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub prospect_name: String,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub filial: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub estimated_value: Option<f64>,
}

crate::maskable!(Opportunity {
    contact_email,
    contact_phone,
    notes,
});

impl OwnedResource for Opportunity {
    fn scope(&self) -> ResourceScope {
        ResourceScope {
            owner_id: self.owner_id.clone(),
            filial: self.filial.clone(),
        }
    }
}

impl Opportunity {
    pub fn stage_display(&self) -> &str {
        self.stage.as_deref().unwrap_or("prospect")
    }
}
