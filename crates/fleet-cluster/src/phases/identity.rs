//! Identity provider client registration
//!
//! Registers the OIDC clients of every integrated application, plus their
//! mappers, roles, scopes and the cluster admin group, then grants the
//! owning user the admin role and group. Every create tolerates an existing
//! object, so a partially registered cluster is completed on retry.
//!
//! Failures here never fail the reconcile: the identity provider is shared
//! infrastructure and is retried on a short fixed delay.

use kube::ResourceExt;
use tracing::{info, warn};

use fleet_common::crd::ManagedCluster;
use fleet_common::Error;

use super::{Transition, REQUEUE_DEPENDENCY};
use crate::controller::Context;
use crate::integrations::presets;
use crate::integrations::IdentityRegistrar;

async fn register(
    identity: &dyn IdentityRegistrar,
    password: &str,
    prefix: &str,
    owner: &str,
) -> Result<(), Error> {
    let token = identity.login(password).await?;

    for client in presets::clients(prefix) {
        identity.create_client(&token, &client).await?;
    }
    for mapper in presets::protocol_mappers(prefix) {
        identity.create_protocol_mapper(&token, &mapper).await?;
    }
    for role in presets::client_roles(prefix) {
        identity.create_client_role(&token, &role).await?;
        if !owner.is_empty() {
            identity.add_client_role_to_user(&token, &role, owner).await?;
        }
    }
    for scope in presets::client_scopes(prefix) {
        identity.add_client_scope(&token, &scope).await?;
    }
    for group in presets::groups(prefix) {
        identity.create_group(&token, &group).await?;
        if !owner.is_empty() {
            identity.add_user_to_group(&token, &group, owner).await?;
        }
    }
    Ok(())
}

pub(super) async fn run(cluster: ManagedCluster, ctx: &Context) -> Result<Transition, Error> {
    let name = cluster.name_any();

    let password = match ctx.identity.admin_password().await {
        Ok(Some(password)) => password,
        Ok(None) => {
            info!(cluster = %name, "identity provider admin password not available yet");
            return Ok(Transition::requeue(cluster, REQUEUE_DEPENDENCY));
        }
        Err(e) => {
            warn!(cluster = %name, error = %e, "failed to read identity provider admin password");
            return Ok(Transition::requeue(cluster, REQUEUE_DEPENDENCY));
        }
    };

    let owner = cluster.owner();
    if owner.is_empty() {
        warn!(cluster = %name, "record has no owner, skipping user grants");
    }

    if let Err(e) = register(
        ctx.identity.as_ref(),
        &password,
        &cluster.namespaced_prefix(),
        owner,
    )
    .await
    {
        warn!(cluster = %name, error = %e, "identity registration incomplete");
        return Ok(Transition::requeue(cluster, REQUEUE_DEPENDENCY));
    }

    info!(cluster = %name, "identity provider clients registered");
    Ok(Transition::proceed(cluster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::Directive;
    use crate::test_support::{sample_cluster, Mocks};
    use fleet_common::crd::ANNOTATION_OWNER;
    use mockall::Sequence;

    fn with_password(mocks: &mut Mocks) {
        mocks
            .identity
            .expect_admin_password()
            .returning(|| Ok(Some("pw".to_string())));
        mocks
            .identity
            .expect_login()
            .withf(|password| password == "pw")
            .returning(|_| Ok("tok".to_string()));
    }

    /// Story: every preset is registered in dependency order and the owner
    /// receives the admin roles and the cluster admin group.
    #[tokio::test]
    async fn registers_presets_and_grants_owner() {
        let mut mocks = Mocks::default();
        with_password(&mut mocks);
        let mut seq = Sequence::new();
        mocks
            .identity
            .expect_create_client()
            .times(6)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mocks
            .identity
            .expect_create_protocol_mapper()
            .times(4)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mocks
            .identity
            .expect_create_client_role()
            .times(3)
            .returning(|_, _| Ok(()));
        mocks
            .identity
            .expect_add_client_role_to_user()
            .withf(|token, _, user| token == "tok" && user == "alice@example.com")
            .times(3)
            .returning(|_, _, _| Ok(()));
        mocks
            .identity
            .expect_add_client_scope()
            .times(1)
            .returning(|_, _| Ok(()));
        mocks
            .identity
            .expect_create_group()
            .withf(|_, g| g.name == "team-a-edge-cluster-admin")
            .times(1)
            .returning(|_, _| Ok(()));
        mocks
            .identity
            .expect_add_user_to_group()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Proceed);
    }

    #[tokio::test]
    async fn ownerless_record_skips_user_grants() {
        let mut mocks = Mocks::default();
        with_password(&mut mocks);
        mocks.identity.expect_create_client().returning(|_, _| Ok(()));
        mocks
            .identity
            .expect_create_protocol_mapper()
            .returning(|_, _| Ok(()));
        mocks
            .identity
            .expect_create_client_role()
            .returning(|_, _| Ok(()));
        mocks.identity.expect_add_client_role_to_user().never();
        mocks.identity.expect_add_client_scope().returning(|_, _| Ok(()));
        mocks.identity.expect_create_group().returning(|_, _| Ok(()));
        mocks.identity.expect_add_user_to_group().never();
        let ctx = mocks.into_context();

        let mut cluster = sample_cluster("edge");
        cluster.annotations_mut().remove(ANNOTATION_OWNER);
        let transition = run(cluster, &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Proceed);
    }

    #[tokio::test]
    async fn failed_step_requeues_instead_of_erroring() {
        let mut mocks = Mocks::default();
        with_password(&mut mocks);
        mocks
            .identity
            .expect_create_client()
            .returning(|_, c| Err(Error::integration("identity", &c.client_id, "503")));
        mocks.identity.expect_create_protocol_mapper().never();
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Requeue(REQUEUE_DEPENDENCY));
    }

    #[tokio::test]
    async fn missing_password_requeues() {
        let mut mocks = Mocks::default();
        mocks.identity.expect_admin_password().returning(|| Ok(None));
        mocks.identity.expect_login().never();
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Requeue(REQUEUE_DEPENDENCY));
    }
}
