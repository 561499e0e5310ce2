// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use strum::{AsRefStr, EnumString};

use crate::{Decrypter, Error, ProviderSettings, PubkeyProvider, Result};

pub mod local;

#[cfg(feature = "azure")]
pub mod azure;

#[derive(AsRefStr, EnumString)]
pub enum DecryptorProvider {
    #[strum(ascii_case_insensitive)]
    Local,

    #[cfg(feature = "azure")]
    #[strum(ascii_case_insensitive, serialize = "azure", serialize = "azure-keyvault")]
    Azure,
}

/// Create a new [`Decrypter`] by given provider name and [`ProviderSettings`]
pub async fn new_decryptor(
    provider_name: &str,
    provider_settings: ProviderSettings,
) -> Result<Arc<dyn Decrypter>> {
    let provider = DecryptorProvider::try_from(provider_name)
        .map_err(|_| Error::UnsupportedProvider(provider_name.to_string()))?;
    match provider {
        DecryptorProvider::Local => Ok(Arc::new(
            local::LocalRsaKey::from_provider_settings(&provider_settings).await?,
        ) as Arc<dyn Decrypter>),

        #[cfg(feature = "azure")]
        DecryptorProvider::Azure => Ok(Arc::new(
            azure::AzureKeyVault::from_provider_settings(&provider_settings)?,
        ) as Arc<dyn Decrypter>),
    }
}

/// Create a new [`PubkeyProvider`] by given provider name and [`ProviderSettings`]
pub async fn new_public_key_provider(
    provider_name: &str,
    provider_settings: ProviderSettings,
) -> Result<Box<dyn PubkeyProvider>> {
    let provider = DecryptorProvider::try_from(provider_name)
        .map_err(|_| Error::UnsupportedProvider(provider_name.to_string()))?;
    match provider {
        DecryptorProvider::Local => Ok(Box::new(
            local::LocalRsaKey::from_provider_settings(&provider_settings).await?,
        ) as Box<dyn PubkeyProvider>),

        #[cfg(feature = "azure")]
        DecryptorProvider::Azure => Ok(Box::new(azure::AzureKeyVault::from_provider_settings(
            &provider_settings,
        )?) as Box<dyn PubkeyProvider>),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::DecryptorProvider;

    #[rstest]
    #[case("local", true)]
    #[case("LOCAL", true)]
    #[case("azure-keyvault", true)]
    #[case("aliyun", false)]
    fn provider_names(#[case] name: &str, #[case] known: bool) {
        assert_eq!(DecryptorProvider::try_from(name).is_ok(), known);
    }
}
