use dcgan_resnet::{
    ChannelLayout, Discriminator, Generator, ImageSize, LayerShape, NetworkConfig, NetworkError,
    ParameterStore, StageConfig,
};
use tch::{Device, Kind, Tensor};

fn shape(name: &str, channels: i64, size: i64) -> LayerShape {
    LayerShape::new(name, channels, size, size)
}

#[test]
fn generator_64x64_scenario() {
    let store = ParameterStore::new(Device::Cpu);
    let config = NetworkConfig::default();
    let gen = Generator::new(&store, &config, false).unwrap();

    let variables = store.var_store().variables();
    assert_eq!(variables["generator.dense.weight"].size(), vec![64 * 4 * 4, config.latent_dim]);

    assert_eq!(
        gen.shapes(),
        &[
            shape("reshape", 64, 4),
            shape("stage_0", 64, 4),
            shape("upsample_0", 64, 8),
            shape("stage_1", 32, 8),
            shape("upsample_1", 32, 16),
            shape("stage_2", 16, 16),
            shape("upsample_2", 16, 32),
            shape("stage_3", 8, 32),
            shape("upsample_3", 8, 64),
            shape("tail_conv", 3, 64),
        ]
    );

    let latent = Tensor::randn([2, config.latent_dim], (Kind::Float, Device::Cpu));
    let images = gen.generate(&latent, false).unwrap();
    assert_eq!(images.size(), vec![2, 3, 64, 64]);
    assert!(images.abs().max().double_value(&[]) <= 1.0);
}

#[test]
fn discriminator_64x64_scenario() {
    let store = ParameterStore::new(Device::Cpu);
    let config = NetworkConfig::default();
    let dis = Discriminator::new(&store, &config, false).unwrap();

    assert_eq!(
        dis.shapes(),
        &[
            shape("head_conv", 64, 64),
            shape("stage_0", 64, 64),
            shape("pool_0", 64, 32),
            shape("stage_1", 128, 32),
            shape("pool_1", 128, 16),
            shape("stage_2", 256, 16),
            shape("pool_2", 256, 8),
            shape("stage_3", 512, 8),
            shape("pool_3", 512, 4),
            shape("global_pool", 512, 1),
            shape("dense", 1, 1),
        ]
    );

    let images = Tensor::rand([1, 3, 64, 64], (Kind::Float, Device::Cpu)) * 2 - 1;
    let scores = tch::no_grad(|| dis.score(&images, false)).unwrap();
    assert_eq!(scores.size(), vec![1, 1]);
}

#[test]
fn generator_feeds_discriminator_in_both_layouts() {
    for layout in [ChannelLayout::ChannelsFirst, ChannelLayout::ChannelsLast] {
        for (bottleneck, version) in [(false, 1), (false, 2), (true, 1), (true, 2)] {
            let config = NetworkConfig {
                image_size: ImageSize { height: 8, width: 16 },
                latent_dim: 6,
                base_filters: 8,
                bottleneck,
                version,
                stages: vec![StageConfig { unit_count: 1, stride: 2 }, StageConfig { unit_count: 2, stride: 2 }],
                channel_layout: layout,
                ..Default::default()
            };
            let store = ParameterStore::new(Device::Cpu);
            let gen = Generator::new(&store, &config, false).unwrap();
            let dis = Discriminator::new(&store, &config, false).unwrap();

            let images = gen.generate(&Tensor::randn([3, 6], (Kind::Float, Device::Cpu)), true).unwrap();
            let expected = match layout {
                ChannelLayout::ChannelsFirst => vec![3, 3, 8, 16],
                ChannelLayout::ChannelsLast => vec![3, 8, 16, 3],
            };
            assert_eq!(images.size(), expected);
            assert_eq!(dis.score(&images, true).unwrap().size(), vec![3, 1]);
        }
    }
}

#[test]
fn networks_never_share_parameters() {
    let store = ParameterStore::new(Device::Cpu);
    let config = NetworkConfig { base_filters: 8, ..Default::default() };
    Generator::new(&store, &config, false).unwrap();
    let generator_count = store.len();
    Discriminator::new(&store, &config, false).unwrap();

    let variables = store.var_store().variables();
    let (gen, dis): (Vec<&String>, Vec<&String>) =
        variables.keys().partition(|name| name.starts_with("generator."));
    assert_eq!(gen.len(), generator_count);
    assert!(dis.iter().all(|name| name.starts_with("discriminator.")));
}

#[test]
fn shared_scope_name_collides() {
    let store = ParameterStore::new(Device::Cpu);
    let config = NetworkConfig { base_filters: 8, ..Default::default() };
    Generator::with_scope(&store, "gan", &config, false).unwrap();
    assert!(matches!(
        Discriminator::with_scope(&store, "gan", &config, false),
        Err(NetworkError::ScopeCollision(name)) if name == "gan"
    ));
}

#[test]
fn dotted_scope_names_are_rejected() {
    let store = ParameterStore::new(Device::Cpu);
    let config = NetworkConfig { base_filters: 8, ..Default::default() };
    assert!(matches!(
        Generator::with_scope(&store, "gan.v1", &config, false),
        Err(NetworkError::InvalidConfig(_))
    ));
    assert!(matches!(
        Discriminator::with_scope(&store, "", &config, false),
        Err(NetworkError::InvalidConfig(_))
    ));
    assert!(store.is_empty());

    Generator::with_scope(&store, "gan", &config, false).unwrap();
    Discriminator::with_scope(&store, "gan_dense", &config, false).unwrap();
    let names = store.var_store().variables().into_keys().collect::<Vec<_>>();
    assert!(names.iter().any(|name| name.starts_with("gan.")));
    assert!(names.iter().any(|name| name.starts_with("gan_dense.")));
}

#[test]
fn invalid_configs_fail_at_construction() {
    let store = ParameterStore::new(Device::Cpu);
    let config = NetworkConfig { stages: vec![], ..Default::default() };
    assert!(matches!(Generator::new(&store, &config, false), Err(NetworkError::InvalidStageConfig(_))));
    assert!(matches!(Discriminator::new(&store, &config, false), Err(NetworkError::InvalidStageConfig(_))));

    let config = NetworkConfig { image_size: ImageSize { height: 40, width: 64 }, ..Default::default() };
    assert!(matches!(Discriminator::new(&store, &config, false), Err(NetworkError::ShapeMismatch(_))));

    let config = NetworkConfig { bottleneck: true, version: 7, ..Default::default() };
    assert!(matches!(
        Discriminator::new(&store, &config, false),
        Err(NetworkError::InvalidVariantSelection { bottleneck: true, version: 7 })
    ));
}
