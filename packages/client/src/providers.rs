use crate::types::{Agent, FavoriteModel, ModelRef, ProviderResponse};

const DEFAULT_PROVIDER_KEY: &str = "providerID";
const DEFAULT_MODEL_KEY: &str = "modelID";

/// Models the server marks as defaults, resolved against the provider list.
///
/// The default mapping is either a single `{providerID, modelID}` pair or a
/// `provider -> model` map; entries naming an unknown provider or model are
/// skipped.
pub fn favorite_models(response: &ProviderResponse) -> Vec<FavoriteModel> {
    let defaults = &response.default;
    let pairs: Vec<(&str, &str)> = match (
        defaults.get(DEFAULT_PROVIDER_KEY),
        defaults.get(DEFAULT_MODEL_KEY),
    ) {
        (Some(provider), Some(model)) => vec![(provider.as_str(), model.as_str())],
        _ => defaults
            .iter()
            .map(|(provider, model)| (provider.as_str(), model.as_str()))
            .collect(),
    };

    pairs
        .into_iter()
        .filter_map(|(provider_id, model_id)| {
            let provider = response.all.iter().find(|provider| provider.id == provider_id)?;
            let model = provider.models.get(model_id)?;
            Some(FavoriteModel {
                provider_id: provider_id.to_string(),
                provider_name: provider.name.clone(),
                model_id: model_id.to_string(),
                model_name: model.name.clone(),
            })
        })
        .collect()
}

pub fn default_model(favorites: &[FavoriteModel]) -> Option<ModelRef> {
    favorites.first().map(FavoriteModel::model_ref)
}

pub fn selectable_agents(agents: &[Agent]) -> Vec<Agent> {
    agents
        .iter()
        .filter(|agent| agent.is_selectable())
        .cloned()
        .collect()
}

/// Agents whose name contains `query`, ignoring case.
pub fn filter_agents<'a>(agents: &'a [Agent], query: &str) -> Vec<&'a Agent> {
    let query = query.to_lowercase();
    agents
        .iter()
        .filter(|agent| agent.name.to_lowercase().contains(&query))
        .collect()
}
