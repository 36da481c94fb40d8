// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Guest converter environment and the credentials secret shared by the
//! converter and the data mover.

use std::collections::BTreeMap;

use dal::Readable;
use models::{
    inventory::{Cluster, ClusterVariant, Host, Kind, Ref, Vm},
    provider::Credentials,
};
use tracing::debug;
use url::Url;

use super::{osmap, static_ips::static_ips, BuildError, Builder};

pub const ENV_VM_NAME: &str = "V2V_vmName";
pub const ENV_LIBVIRT_URL: &str = "V2V_libvirtURL";
pub const ENV_SOURCE: &str = "V2V_source";
pub const ENV_FINGERPRINT: &str = "V2V_fingerprint";
pub const ENV_EXTRA_ARGS: &str = "V2V_extra_args";
pub const ENV_PRESERVE_STATIC_IPS: &str = "V2V_preserveStaticIPs";
pub const ENV_STATIC_IPS: &str = "V2V_staticIPs";
pub const ENV_VIRTIO_WIN: &str = "VIRTIO_WIN";

pub const SECRET_USER: &str = "accessKeyId";
pub const SECRET_PASSWORD: &str = "secretKey";
pub const SECRET_THUMBPRINT: &str = "thumbprint";
pub const SECRET_CACERT: &str = "cacert";

const SOURCE_VSPHERE: &str = "vSphere";
const LEGACY_DRIVERS_IMAGE: &str = "/usr/local/virtio-win-legacy.iso";

impl<'a, R: Readable> Builder<'a, R> {
    /// Environment handed to the guest converter for `vm`
    pub fn environment(&self, vm: &Vm) -> Result<BTreeMap<String, String>, BuildError> {
        let host = self.host(vm)?;
        let (libvirt_url, fingerprint) = self.libvirt_url(vm, host.as_ref())?;

        let mut env = BTreeMap::from([
            (ENV_VM_NAME.to_owned(), vm.name.clone()),
            (ENV_LIBVIRT_URL.to_owned(), libvirt_url),
            (ENV_SOURCE.to_owned(), SOURCE_VSPHERE.to_owned()),
            (ENV_FINGERPRINT.to_owned(), fingerprint),
        ]);

        if !self.conversion.extra_args.is_empty() {
            env.insert(ENV_EXTRA_ARGS.to_owned(), self.conversion.extra_args.join(" "));
        }

        if self.plan.preserve_static_ips {
            env.insert(ENV_PRESERVE_STATIC_IPS.to_owned(), "true".to_owned());
            let ips = static_ips(vm);
            if !ips.is_empty() {
                env.insert(ENV_STATIC_IPS.to_owned(), ips);
            }
        }

        let legacy = self
            .plan
            .install_legacy_drivers
            .unwrap_or_else(|| osmap::is_legacy_windows(vm));
        if legacy {
            let image = self
                .conversion
                .virtio_win_image
                .clone()
                .unwrap_or_else(|| LEGACY_DRIVERS_IMAGE.to_owned());
            debug!(vm = %vm.id, "Installing legacy drivers from {image}");
            env.insert(ENV_VIRTIO_WIN.to_owned(), image);
        }

        Ok(env)
    }

    /// Credentials the converter and mover log in with, as secret data
    pub fn secret(&self, vm: &Vm) -> Result<BTreeMap<String, String>, BuildError> {
        let host_override = vm
            .host
            .as_ref()
            .and_then(|h| self.plan.host_override(&h.id));

        let (credentials, thumbprint) = match host_override {
            Some(o) => {
                let host = self.host(vm)?;
                (
                    Credentials::from_secret(&o.credentials)?,
                    host.map(|h| h.thumbprint).unwrap_or_default(),
                )
            }
            None => (self.provider.credentials.clone(), self.fingerprint.clone()),
        };

        let mut data = BTreeMap::from([
            (SECRET_USER.to_owned(), credentials.user),
            (SECRET_PASSWORD.to_owned(), credentials.password),
            (SECRET_THUMBPRINT.to_owned(), thumbprint),
        ]);
        if let Some(pem) = self.provider.credentials.cacert.clone() {
            data.insert(SECRET_CACERT.to_owned(), pem);
        }

        Ok(data)
    }

    /// The libvirt URL the converter reads the VM from, with the certificate
    /// fingerprint it must present.
    fn libvirt_url(&self, vm: &Vm, host: Option<&Host>) -> Result<(String, String), BuildError> {
        let host_override = vm
            .host
            .as_ref()
            .and_then(|h| self.plan.host_override(&h.id));

        if let Some(o) = host_override {
            let user = Credentials::from_secret(&o.credentials)?.user;
            let mut url = Url::parse(&format!("esx://{}", o.ip_address))?;
            set_user(&mut url, &user)?;
            url.set_query(Some("no_verify=1"));

            let fingerprint = if self.provider.is_esxi() {
                self.fingerprint.clone()
            } else {
                host.map(|h| h.thumbprint.clone()).unwrap_or_default()
            };
            return Ok((url.to_string(), fingerprint));
        }

        let user = &self.provider.credentials.user;
        let mut url = if self.provider.is_esxi() {
            let name = host.map(|h| h.name.as_str()).unwrap_or_default();
            Url::parse(&format!("esx://{name}"))?
        } else {
            let provider = Url::parse(&self.provider.url)?;
            let mut url = Url::parse(&format!("vpx://{}", provider.host_str().unwrap_or_default()))?;
            url.set_path(&self.compute_path(host)?);
            url
        };
        set_user(&mut url, user)?;
        if self.provider.credentials.insecure_skip_verify {
            url.set_query(Some("no_verify=1"));
        }

        Ok((url.to_string(), self.fingerprint.clone()))
    }

    /// Inventory path of the host, or of its compute resource when the host
    /// stands alone.
    fn compute_path(&self, host: Option<&Host>) -> Result<String, BuildError> {
        let Some(host) = host else {
            return Ok(String::new());
        };

        if let Some(parent) = host.parent.as_ref().filter(|p| p.kind == Kind::Cluster) {
            let cluster = self.inventory.get_as::<Cluster>(&parent.id)?;
            if cluster.variant == ClusterVariant::ComputeResource {
                return Ok(self.inventory.path(parent)?);
            }
        }

        Ok(self.inventory.path(&Ref::new(Kind::Host, host.id.clone()))?)
    }
}

fn set_user(url: &mut Url, user: &str) -> Result<(), url::ParseError> {
    url.set_username(user)
        .map_err(|_| url::ParseError::EmptyHost)
}
